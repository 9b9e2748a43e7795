use std::cmp::max;

use serde::Serialize;
use tracing::debug;

use crashperm_common::wlog::{WriteLog, WriteRecord};

pub mod config;
pub mod epoch;
pub use epoch::{build_epochs, Epoch, EpochOp};

pub mod fingerprint;
pub use fingerprint::{Fingerprint, FingerprintSet};

mod set;
pub mod strategy;
pub use strategy::{
    build_strategy, CrashStateStrategy, ExhaustivePermuter, HeuristicPermuter, RandomPermuter,
    StrategyKind,
};

pub mod session;

/// One hypothesis of which writes reached the disk, and in which order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrashState<'a> {
    ops: Vec<EpochOp<'a>>,
}

impl<'a> CrashState<'a> {
    pub fn new(ops: Vec<EpochOp<'a>>) -> Self {
        CrashState { ops }
    }

    pub fn ops(&self) -> &[EpochOp<'a>] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.ops.iter().map(|op| op.abs_index).collect()
    }

    /// The writes to replay, in crash-state order.
    pub fn writes(&self) -> impl Iterator<Item = &'a WriteRecord> + '_ {
        self.ops.iter().map(|op| op.op)
    }
}

/// Result of one [`Permuter::generate_crash_state`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashStateOutcome<'a> {
    /// A state that was never returned before.
    Unique(CrashState<'a>),
    /// The retry budget ran out; carries the last (already seen) candidate.
    Exhausted(CrashState<'a>),
    /// The strategy has nothing left to propose.
    NoMoreStates,
}

impl<'a> CrashStateOutcome<'a> {
    pub fn accepted(&self) -> bool {
        matches!(self, CrashStateOutcome::Unique(_))
    }

    pub fn state(&self) -> Option<&CrashState<'a>> {
        match self {
            CrashStateOutcome::Unique(state) | CrashStateOutcome::Exhausted(state) => Some(state),
            CrashStateOutcome::NoMoreStates => None,
        }
    }

    pub fn into_state(self) -> Option<CrashState<'a>> {
        match self {
            CrashStateOutcome::Unique(state) | CrashStateOutcome::Exhausted(state) => Some(state),
            CrashStateOutcome::NoMoreStates => None,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PermuterStats {
    pub calls: usize,
    /// candidates requested from the strategy
    pub candidates: usize,
    pub accepted: usize,
    /// candidates rejected because their fingerprint was already seen
    pub duplicates: usize,
    pub exhausted: usize,
    pub no_more_states: usize,
}

/// Turns a write log into a stream of distinct crash states.
///
/// The epochs are built once from the log and stay read-only. Every accepted
/// fingerprint is remembered for the lifetime of the permuter. Not meant to be
/// shared between threads.
pub struct Permuter<'a, S> {
    epochs: Vec<Epoch<'a>>,
    strategy: S,
    seen: FingerprintSet,
    stats: PermuterStats,
}

impl<'a, S: CrashStateStrategy> Permuter<'a, S> {
    pub fn new(log: &'a WriteLog, strategy: S) -> Self {
        let epochs = build_epochs(log);
        debug!(writes = log.len(), epochs = epochs.len(), "built epochs");
        Permuter {
            epochs,
            strategy,
            seen: FingerprintSet::new(),
            stats: PermuterStats::default(),
        }
    }

    pub fn epochs(&self) -> &[Epoch<'a>] {
        &self.epochs
    }

    pub fn seen(&self) -> &FingerprintSet {
        &self.seen
    }

    pub fn stats(&self) -> &PermuterStats {
        &self.stats
    }

    fn next_candidate(&mut self) -> Option<CrashState<'a>> {
        self.stats.candidates += 1;
        self.strategy.next_state(&self.epochs)
    }

    /// Ask the strategy for states until one has an unseen fingerprint.
    ///
    /// The strategy gets at most `2 * len` attempts, where `len` is the length
    /// of the first candidate (at least one attempt for an empty candidate).
    /// An accepted fingerprint is recorded before returning.
    pub fn generate_crash_state(&mut self) -> CrashStateOutcome<'a> {
        self.stats.calls += 1;
        let mut state = match self.next_candidate() {
            Some(state) => state,
            None => return self.no_more_states(),
        };
        let max_attempts = max(1, 2 * state.len());
        let mut attempts = 1;
        loop {
            let fingerprint = state.fingerprint();
            if !self.seen.contains(&fingerprint) {
                debug!(attempts, len = state.len(), "accepted crash state");
                self.seen.insert(fingerprint);
                self.stats.accepted += 1;
                return CrashStateOutcome::Unique(state);
            }
            self.stats.duplicates += 1;
            if attempts >= max_attempts {
                debug!(
                    attempts,
                    seen = self.seen.len(),
                    "no unseen crash state within retry budget"
                );
                self.stats.exhausted += 1;
                return CrashStateOutcome::Exhausted(state);
            }
            state = match self.next_candidate() {
                Some(state) => state,
                None => return self.no_more_states(),
            };
            attempts += 1;
        }
    }

    fn no_more_states(&mut self) -> CrashStateOutcome<'a> {
        debug!(seen = self.seen.len(), "strategy has no more crash states");
        self.stats.no_more_states += 1;
        CrashStateOutcome::NoMoreStates
    }
}
