//! Driving one permuter over a whole trial and recording what it produced.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Serialize, Serializer};
use tracing::info;

use crashperm_common::wlog::WriteLog;

use crate::config::Config;
use crate::strategy::{build_strategy, StrategyKind};
use crate::{CrashState, CrashStateOutcome, Fingerprint, Permuter, PermuterStats};

/// blake3 over the sector, size and payload of every write of a crash state.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct CrashStateHash(blake3::Hash);

impl CrashStateHash {
    pub fn of(state: &CrashState) -> Self {
        let mut hasher = blake3::Hasher::new();
        for write in state.writes() {
            hasher.update(&write.sector.to_le_bytes());
            hasher.update(&write.size.to_le_bytes());
            match &write.data {
                Some(data) => {
                    hasher.update(&(data.len() as u64).to_le_bytes());
                    hasher.update(data);
                }
                None => {
                    hasher.update(&u64::MAX.to_le_bytes());
                }
            }
        }
        CrashStateHash(hasher.finalize())
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }
}

impl Serialize for CrashStateHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_hex())
    }
}

/// One accepted crash state.
#[derive(Debug, Serialize)]
pub struct CrashStateRecord {
    pub index: usize,
    pub digest: CrashStateHash,
    /// absolute log positions in replay order
    pub fingerprint: Fingerprint,
    pub writes: usize,
    pub data_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxStates,
    Exhausted,
    NoMoreStates,
}

#[derive(Debug, Serialize)]
pub struct SessionReport {
    pub strategy: StrategyKind,
    pub seed: u64,
    pub writes: usize,
    pub epochs: usize,
    pub stop_reason: StopReason,
    pub stats: PermuterStats,
    /// distinct write contents among the accepted states
    pub distinct_digests: usize,
    pub crash_states: Vec<CrashStateRecord>,
}

/// Generate crash states for `log` until the configuration says to stop.
pub fn run_session(log: &WriteLog, config: &Config) -> Result<SessionReport> {
    config.validate()?;
    let mut permuter = Permuter::new(log, build_strategy(config.strategy, config.seed));
    info!(
        strategy = ?config.strategy,
        writes = log.len(),
        epochs = permuter.epochs().len(),
        "starting permutation session"
    );

    let mut crash_states = Vec::new();
    let stop_reason = loop {
        if config.max_states == Some(crash_states.len()) {
            break StopReason::MaxStates;
        }
        match permuter.generate_crash_state() {
            CrashStateOutcome::Unique(state) => {
                crash_states.push(CrashStateRecord {
                    index: crash_states.len(),
                    digest: CrashStateHash::of(&state),
                    fingerprint: state.fingerprint(),
                    writes: state.len(),
                    data_bytes: state.writes().map(|w| w.data_len()).sum(),
                });
            }
            CrashStateOutcome::Exhausted(_) => {
                if config.stop_on_exhaustion {
                    break StopReason::Exhausted;
                }
            }
            CrashStateOutcome::NoMoreStates => break StopReason::NoMoreStates,
        }
    };

    let distinct_digests = crash_states
        .iter()
        .map(|s| s.digest)
        .collect::<HashSet<_>>()
        .len();
    info!(
        accepted = crash_states.len(),
        distinct_digests,
        ?stop_reason,
        "permutation session finished"
    );
    Ok(SessionReport {
        strategy: config.strategy,
        seed: config.seed,
        writes: log.len(),
        epochs: permuter.epochs().len(),
        stop_reason,
        stats: permuter.stats().clone(),
        distinct_digests,
        crash_states,
    })
}

impl SessionReport {
    /// Write `<output_dir>/crash_states/`: one textual write log per crash state
    /// plus `index.yaml` describing the session.
    pub fn persist(&self, log: &WriteLog, output_dir: &Path) -> Result<PathBuf> {
        let dir = output_dir.join("crash_states");
        if dir.exists() {
            bail!("output directory {} already exists", dir.display());
        }
        std::fs::create_dir_all(&dir).context("could not create crash_states directory")?;
        for record in &self.crash_states {
            let path = dir.join(format!("{:06}.log", record.index));
            let mut out = BufWriter::new(
                File::create(&path)
                    .with_context(|| format!("could not create {}", path.display()))?,
            );
            for &pos in record.fingerprint.positions() {
                let write = log.get(pos).ok_or_else(|| {
                    anyhow!("crash state {} refers to unknown write {}", record.index, pos)
                })?;
                writeln!(out, "{}", write.to_text())?;
            }
            out.flush()
                .with_context(|| format!("could not write {}", path.display()))?;
        }
        let index_path = dir.join("index.yaml");
        let index_file = File::create(&index_path)?;
        serde_yaml::to_writer(&index_file, self).context("failed writing crash_states/index.yaml")?;
        Ok(index_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_log() -> WriteLog {
        let mut log = WriteLog::new();
        log.push(0, 1, false, true, Some(vec![1]));
        log.push(1, 1, false, false, Some(vec![2]));
        log.push(2, 1, false, false, Some(vec![3]));
        log.push(0, 0, true, false, None);
        log.push(3, 1, false, false, Some(vec![4, 5]));
        log
    }

    #[test]
    fn test_exhaustive_session_runs_dry() -> Result<()> {
        let log = sample_log();
        let config = Config {
            strategy: StrategyKind::Exhaustive,
            ..Config::default()
        };
        let report = run_session(&log, &config)?;
        // 3! orderings in the first epoch, one in the second
        assert_eq!(report.crash_states.len(), 7);
        assert_eq!(report.stop_reason, StopReason::Exhausted);
        assert_eq!(report.epochs, 2);
        assert_eq!(report.distinct_digests, 7);
        assert_eq!(report.crash_states[0].writes, 3);
        assert_eq!(report.crash_states[6].writes, 5);
        assert_eq!(report.crash_states[6].data_bytes, 5);
        Ok(())
    }

    #[test]
    fn test_max_states() -> Result<()> {
        let log = sample_log();
        let config = Config {
            max_states: Some(3),
            stop_on_exhaustion: false,
            ..Config::default()
        };
        let report = run_session(&log, &config)?;
        assert_eq!(report.crash_states.len(), 3);
        assert_eq!(report.stop_reason, StopReason::MaxStates);
        let indices: Vec<usize> = report.crash_states.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        Ok(())
    }

    #[test]
    fn test_digest_ignores_positions() {
        let mut log = WriteLog::new();
        log.push(0, 1, false, false, Some(vec![9]));
        log.push(0, 1, false, false, Some(vec![9]));
        let epochs = crate::build_epochs(&log);
        let a = CrashState::new(vec![epochs[0].ops[0]]);
        let b = CrashState::new(vec![epochs[0].ops[1]]);
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(CrashStateHash::of(&a), CrashStateHash::of(&b));
        assert_ne!(CrashStateHash::of(&a), CrashStateHash::of(&CrashState::default()));
    }

    #[test]
    fn test_persist() -> Result<()> {
        let log = sample_log();
        let config = Config {
            strategy: StrategyKind::Exhaustive,
            ..Config::default()
        };
        let report = run_session(&log, &config)?;
        let dir = tempfile::tempdir()?;
        let index = report.persist(&log, dir.path())?;
        let index_text = std::fs::read_to_string(&index)?;
        assert!(index_text.contains("stop_reason: exhausted"), "{}", index_text);
        assert!(index_text.contains(&report.crash_states[0].digest.to_hex()));
        assert!(index_text.contains("writes: 3"), "{}", index_text);

        let first = std::fs::read_to_string(dir.path().join("crash_states").join("000000.log"))?;
        let replayed = WriteLog::read_text(first.as_bytes())?;
        assert_eq!(replayed.len(), 3);
        assert_eq!(replayed.records()[0].data.as_deref(), Some([1].as_slice()));

        assert!(report.persist(&log, dir.path()).is_err());
        Ok(())
    }
}
