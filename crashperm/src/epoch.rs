//! Segmentation of a write log into barrier-delimited epochs.

use std::cmp::{max, min};
use std::ops::Range;

use tracing::trace;

use crashperm_common::wlog::{WriteLog, WriteRecord};

/// A write inside an epoch. Borrows the record from the log, never its buffer contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochOp<'a> {
    pub abs_index: usize,
    pub op: &'a WriteRecord,
}

/// A run of writes up to and including the next barrier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Epoch<'a> {
    pub ops: Vec<EpochOp<'a>>,
    /// the last op is a barrier
    pub has_barrier: bool,
    /// at least two ops touch a common sector
    pub overlaps: bool,
    pub num_meta: usize,
}

impl<'a> Epoch<'a> {
    pub fn barrier(&self) -> Option<&EpochOp<'a>> {
        if self.has_barrier {
            self.ops.last()
        } else {
            None
        }
    }

    /// All ops except the closing barrier.
    pub fn non_barrier_ops(&self) -> &[EpochOp<'a>] {
        if self.has_barrier {
            &self.ops[..self.ops.len() - 1]
        } else {
            &self.ops
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

fn range_overlap<T>(r1: &Range<T>, r2: &Range<T>) -> Range<T>
where
    T: std::cmp::Ord + Copy,
{
    Range {
        start: max(r1.start, r2.start),
        end: min(r1.end, r2.end),
    }
}

/// Sorted, disjoint sector ranges written so far in the current epoch.
#[derive(Debug, Default)]
struct RangeTracker {
    ranges: Vec<Range<u64>>,
}

impl RangeTracker {
    /// Record `range` and report whether it intersects anything tracked before.
    ///
    /// The scan finishes before the list is modified. All intersecting entries
    /// are merged with `range` into one; otherwise `range` is inserted at its
    /// sorted position. Empty ranges never intersect and are not tracked.
    fn track(&mut self, range: Range<u64>) -> bool {
        if range.is_empty() {
            return false;
        }
        let mut hits: Option<Range<usize>> = None;
        let mut merged = range.clone();
        let mut insert_at = self.ranges.len();
        for (idx, tracked) in self.ranges.iter().enumerate() {
            if !range_overlap(tracked, &range).is_empty() {
                merged = min(merged.start, tracked.start)..max(merged.end, tracked.end);
                hits = Some(hits.map_or(idx..idx + 1, |h| h.start..idx + 1));
            } else if tracked.start >= range.end {
                // list is sorted: nothing further can intersect
                insert_at = idx;
                break;
            }
        }
        match hits {
            Some(hits) => {
                self.ranges.splice(hits, std::iter::once(merged));
                true
            }
            None => {
                self.ranges.insert(insert_at, range);
                false
            }
        }
    }
}

/// Split `log` into epochs. Every record lands in exactly one epoch, in log order.
pub fn build_epochs(log: &WriteLog) -> Vec<Epoch<'_>> {
    let mut epochs = Vec::new();
    let mut current = Epoch::default();
    let mut tracker = RangeTracker::default();

    for (abs_index, record) in log.iter().enumerate() {
        debug_assert_eq!(abs_index, record.id);
        if tracker.track(record.range()) {
            current.overlaps = true;
        }
        if record.metadata {
            current.num_meta += 1;
        }
        current.ops.push(EpochOp {
            abs_index,
            op: record,
        });
        if record.barrier {
            current.has_barrier = true;
            close_epoch(&mut epochs, std::mem::take(&mut current));
            tracker = RangeTracker::default();
        }
    }
    if !current.is_empty() {
        close_epoch(&mut epochs, current);
    }
    epochs
}

fn close_epoch<'a>(epochs: &mut Vec<Epoch<'a>>, epoch: Epoch<'a>) {
    trace!(
        epoch = epochs.len(),
        ops = epoch.len(),
        has_barrier = epoch.has_barrier,
        overlaps = epoch.overlaps,
        num_meta = epoch.num_meta,
        "closed epoch"
    );
    epochs.push(epoch);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn log_of(writes: &[(u64, u64, bool)]) -> WriteLog {
        let mut log = WriteLog::new();
        for &(sector, size, barrier) in writes {
            log.push(sector, size, barrier, false, None);
        }
        log
    }

    fn positions(epoch: &Epoch) -> Vec<usize> {
        epoch.ops.iter().map(|op| op.abs_index).collect()
    }

    #[test]
    fn test_same_sector_before_barrier() {
        let log = log_of(&[(0, 1, false), (0, 1, true)]);
        let epochs = build_epochs(&log);
        assert_eq!(epochs.len(), 1);
        assert!(epochs[0].has_barrier);
        assert!(epochs[0].overlaps);
        assert_eq!(positions(&epochs[0]), vec![0, 1]);
        assert_eq!(epochs[0].barrier().map(|b| b.abs_index), Some(1));
        assert_eq!(epochs[0].non_barrier_ops().len(), 1);
    }

    #[test]
    fn test_disjoint_without_barrier() {
        let log = log_of(&[(0, 1, false), (10, 1, false)]);
        let epochs = build_epochs(&log);
        assert_eq!(epochs.len(), 1);
        assert!(!epochs[0].has_barrier);
        assert!(!epochs[0].overlaps);
        assert!(epochs[0].barrier().is_none());
        assert_eq!(epochs[0].non_barrier_ops().len(), 2);
    }

    #[test]
    fn test_empty_log() {
        assert!(build_epochs(&WriteLog::new()).is_empty());
    }

    #[test]
    fn test_single_barrier() {
        let log = log_of(&[(4, 0, true)]);
        let epochs = build_epochs(&log);
        assert_eq!(epochs.len(), 1);
        assert_eq!(positions(&epochs[0]), vec![0]);
        assert!(epochs[0].has_barrier);
        assert!(epochs[0].non_barrier_ops().is_empty());
    }

    #[test]
    fn test_one_epoch_per_barrier() {
        let log = log_of(&[
            (0, 1, false),
            (1, 1, true),
            (2, 1, true),
            (3, 1, false),
            (3, 1, false),
            (9, 1, true),
        ]);
        let epochs = build_epochs(&log);
        assert_eq!(epochs.len(), 3);
        assert!(epochs.iter().all(|e| e.has_barrier));
        assert_eq!(positions(&epochs[1]), vec![2]);
        assert!(!epochs[0].overlaps);
        assert!(epochs[2].overlaps);
    }

    #[test]
    fn test_overlap_does_not_leak_across_barrier() {
        let log = log_of(&[(0, 4, true), (2, 1, false)]);
        let epochs = build_epochs(&log);
        assert_eq!(epochs.len(), 2);
        assert!(!epochs[0].overlaps);
        assert!(!epochs[1].overlaps);
        assert!(!epochs[1].has_barrier);
    }

    #[test]
    fn test_adjacent_ranges_do_not_overlap() {
        let log = log_of(&[(0, 2, false), (2, 2, false), (4, 1, false)]);
        assert!(!build_epochs(&log)[0].overlaps);
    }

    #[test]
    fn test_zero_length_writes_never_overlap() {
        let log = log_of(&[(0, 8, false), (3, 0, false), (3, 0, true)]);
        assert!(!build_epochs(&log)[0].overlaps);
    }

    #[test]
    fn test_range_inserted_before_existing() {
        // second write lands before the first one, third hits the second
        let log = log_of(&[(10, 2, false), (0, 2, false), (1, 1, false)]);
        assert!(build_epochs(&log)[0].overlaps);
    }

    #[test]
    fn test_writes_at_last_sector() {
        let log = log_of(&[(u64::MAX - 1, 4, false), (u64::MAX - 1, 1, true)]);
        let epochs = build_epochs(&log);
        assert_eq!(epochs.len(), 1);
        assert!(epochs[0].overlaps);
    }

    #[test]
    fn test_metadata_counted() {
        let mut log = WriteLog::new();
        log.push(0, 1, false, true, None);
        log.push(1, 1, false, false, Some(vec![1]));
        log.push(2, 1, true, true, None);
        log.push(3, 1, false, true, None);
        let epochs = build_epochs(&log);
        assert_eq!(epochs[0].num_meta, 2);
        assert_eq!(epochs[1].num_meta, 1);
    }

    #[test]
    fn test_tracker_merges_bridged_ranges() {
        let mut tracker = RangeTracker::default();
        assert!(!tracker.track(0..2));
        assert!(!tracker.track(4..6));
        assert!(!tracker.track(8..9));
        assert!(tracker.track(1..5));
        assert_eq!(tracker.ranges, vec![0..6, 8..9]);
        assert!(!tracker.track(6..8));
        assert_eq!(tracker.ranges, vec![0..6, 6..8, 8..9]);
    }

    fn arb_log() -> impl Strategy<Value = WriteLog> {
        proptest::collection::vec(
            (0_u64..32, 0_u64..4, proptest::bool::weighted(0.2), any::<bool>()),
            0..40,
        )
        .prop_map(|writes| {
            let mut log = WriteLog::new();
            for (sector, size, barrier, metadata) in writes {
                log.push(sector, size, barrier, metadata, None);
            }
            log
        })
    }

    fn pairwise_overlap(epoch: &Epoch) -> bool {
        let ops = &epoch.ops;
        (0..ops.len()).any(|i| {
            (i + 1..ops.len())
                .any(|j| !range_overlap(&ops[i].op.range(), &ops[j].op.range()).is_empty())
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn epochs_concatenate_to_log(log in arb_log()) {
            let epochs = build_epochs(&log);
            let flattened: Vec<usize> = epochs
                .iter()
                .flat_map(|e| e.ops.iter().map(|op| op.abs_index))
                .collect();
            prop_assert_eq!(flattened, (0..log.len()).collect::<Vec<_>>());
            for epoch in &epochs {
                prop_assert!(!epoch.is_empty());
                for (idx, op) in epoch.ops.iter().enumerate() {
                    prop_assert!(std::ptr::eq(op.op, &log.records()[op.abs_index]));
                    prop_assert_eq!(op.op.barrier, epoch.has_barrier && idx + 1 == epoch.len());
                }
            }
        }

        #[test]
        fn overlap_flag_matches_pairwise_check(log in arb_log()) {
            for epoch in build_epochs(&log) {
                prop_assert_eq!(epoch.overlaps, pairwise_overlap(&epoch));
            }
        }

        #[test]
        fn barrier_count_bounds_epochs(log in arb_log()) {
            let barriers = log.iter().filter(|r| r.barrier).count();
            let trailing = log.records().last().map_or(false, |r| !r.barrier);
            prop_assert_eq!(build_epochs(&log).len(), barriers + usize::from(trailing));
        }
    }
}
