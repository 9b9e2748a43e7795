//! Strategies that propose crash states for the permuter.

use std::collections::HashMap;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::epoch::{Epoch, EpochOp};
use crate::set;
use crate::CrashState;

/// Proposes one crash state per call.
///
/// `None` means the strategy has nothing left to propose. An empty epoch list
/// must produce an empty crash state.
pub trait CrashStateStrategy {
    fn next_state<'a>(&mut self, epochs: &[Epoch<'a>]) -> Option<CrashState<'a>>;
}

impl<S: CrashStateStrategy + ?Sized> CrashStateStrategy for Box<S> {
    fn next_state<'a>(&mut self, epochs: &[Epoch<'a>]) -> Option<CrashState<'a>> {
        (**self).next_state(epochs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Random,
    Exhaustive,
    Heuristic,
}

/// Instantiate the strategy selected in a configuration.
pub fn build_strategy(kind: StrategyKind, seed: u64) -> Box<dyn CrashStateStrategy + Send> {
    match kind {
        StrategyKind::Random => Box::new(RandomPermuter::new(seed)),
        StrategyKind::Exhaustive => Box::new(ExhaustivePermuter::new()),
        StrategyKind::Heuristic => Box::new(HeuristicPermuter::new(seed)),
    }
}

/// Every op of the epochs before `crash_epoch`, in log order.
fn persisted_prefix<'a>(epochs: &[Epoch<'a>], crash_epoch: usize) -> Vec<EpochOp<'a>> {
    epochs[..crash_epoch]
        .iter()
        .flat_map(|epoch| epoch.ops.iter().copied())
        .collect()
}

/// Crashes in a uniformly chosen epoch; a random subset of that epoch's writes
/// reaches the disk in random order.
pub struct RandomPermuter {
    rng: fastrand::Rng,
}

impl RandomPermuter {
    pub fn new(seed: u64) -> Self {
        RandomPermuter {
            rng: fastrand::Rng::with_seed(seed),
        }
    }
}

impl CrashStateStrategy for RandomPermuter {
    fn next_state<'a>(&mut self, epochs: &[Epoch<'a>]) -> Option<CrashState<'a>> {
        if epochs.is_empty() {
            return Some(CrashState::default());
        }
        let crash_epoch = self.rng.usize(..epochs.len());
        let mut ops = persisted_prefix(epochs, crash_epoch);
        let mut in_flight = set::random_subset(&mut self.rng, epochs[crash_epoch].non_barrier_ops());
        self.rng.shuffle(&mut in_flight);
        ops.extend(in_flight);
        Some(CrashState::new(ops))
    }
}

type Orders = Box<dyn Iterator<Item = Vec<usize>> + Send>;

/// Walks the epochs in order and, for each, every reordering of its
/// non-barrier writes on top of all earlier epochs.
pub struct ExhaustivePermuter {
    cycle: bool,
    finished: bool,
    epoch: usize,
    orders: Option<Orders>,
}

impl ExhaustivePermuter {
    /// Restarts from the first epoch once every ordering was produced.
    pub fn new() -> Self {
        ExhaustivePermuter {
            cycle: true,
            finished: false,
            epoch: 0,
            orders: None,
        }
    }

    /// Stops with `None` once every ordering was produced.
    pub fn once() -> Self {
        ExhaustivePermuter {
            cycle: false,
            ..Self::new()
        }
    }
}

impl Default for ExhaustivePermuter {
    fn default() -> Self {
        Self::new()
    }
}

impl CrashStateStrategy for ExhaustivePermuter {
    fn next_state<'a>(&mut self, epochs: &[Epoch<'a>]) -> Option<CrashState<'a>> {
        if self.finished {
            return None;
        }
        if epochs.is_empty() {
            self.finished = !self.cycle;
            return Some(CrashState::default());
        }
        loop {
            if self.epoch >= epochs.len() {
                if !self.cycle {
                    self.finished = true;
                    return None;
                }
                self.epoch = 0;
            }
            let in_flight = epochs[self.epoch].non_barrier_ops();
            let orders = self.orders.get_or_insert_with(|| -> Orders {
                let n = in_flight.len();
                if n == 0 {
                    Box::new(std::iter::once(Vec::new()))
                } else {
                    Box::new((0..n).permutations(n))
                }
            });
            match orders.next() {
                Some(order) => {
                    let mut ops = persisted_prefix(epochs, self.epoch);
                    ops.extend(order.into_iter().map(|idx| in_flight[idx]));
                    return Some(CrashState::new(ops));
                }
                None => {
                    self.orders = None;
                    self.epoch += 1;
                }
            }
        }
    }
}

/// Epochs with at most this many in-flight writes get their whole powerset explored.
const MAX_POWERSET_OPS: usize = 4;
/// Extra weight of an epoch with overlapping writes.
const OVERLAP_WEIGHT: usize = 4;

/// Prefers epochs with metadata writes and overlapping ranges. Metadata writes
/// keep their relative log order; only data writes are reordered.
pub struct HeuristicPermuter {
    rng: fastrand::Rng,
    /// next powerset entry per small epoch
    cursors: HashMap<usize, usize>,
}

impl HeuristicPermuter {
    pub fn new(seed: u64) -> Self {
        HeuristicPermuter {
            rng: fastrand::Rng::with_seed(seed),
            cursors: HashMap::new(),
        }
    }

    fn weight(epoch: &Epoch) -> usize {
        1 + epoch.num_meta + OVERLAP_WEIGHT * usize::from(epoch.overlaps)
    }

    fn pick_epoch(&mut self, epochs: &[Epoch]) -> usize {
        let total: usize = epochs.iter().map(Self::weight).sum();
        let mut ticket = self.rng.usize(..total);
        for (idx, epoch) in epochs.iter().enumerate() {
            let weight = Self::weight(epoch);
            if ticket < weight {
                return idx;
            }
            ticket -= weight;
        }
        epochs.len() - 1
    }

    fn pick_subset<'a>(&mut self, crash_epoch: usize, in_flight: &[EpochOp<'a>]) -> Vec<EpochOp<'a>> {
        if in_flight.is_empty() {
            return Vec::new();
        }
        if in_flight.len() <= MAX_POWERSET_OPS {
            let cursor = self.cursors.entry(crash_epoch).or_insert(0);
            // skip the empty set
            let subsets = (1 << in_flight.len()) - 1;
            let subset = (0..in_flight.len())
                .powerset()
                .skip(1)
                .nth(*cursor % subsets)
                .unwrap_or_default();
            *cursor += 1;
            subset.into_iter().map(|idx| in_flight[idx]).collect()
        } else {
            set::random_subset(&mut self.rng, in_flight)
        }
    }

    /// Shuffle the data writes among the slots held by data writes.
    fn reorder_data<'a>(&mut self, subset: Vec<EpochOp<'a>>) -> Vec<EpochOp<'a>> {
        let mut data: Vec<EpochOp<'a>> = subset.iter().copied().filter(|op| !op.op.metadata).collect();
        self.rng.shuffle(&mut data);
        let mut data = data.into_iter();
        subset
            .into_iter()
            .map(|op| {
                if op.op.metadata {
                    op
                } else {
                    // same number of data slots as shuffled data writes
                    data.next().unwrap_or(op)
                }
            })
            .collect()
    }
}

impl CrashStateStrategy for HeuristicPermuter {
    fn next_state<'a>(&mut self, epochs: &[Epoch<'a>]) -> Option<CrashState<'a>> {
        if epochs.is_empty() {
            return Some(CrashState::default());
        }
        let crash_epoch = self.pick_epoch(epochs);
        let mut ops = persisted_prefix(epochs, crash_epoch);
        let subset = self.pick_subset(crash_epoch, epochs[crash_epoch].non_barrier_ops());
        ops.extend(self.reorder_data(subset));
        Some(CrashState::new(ops))
    }
}
