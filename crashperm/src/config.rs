use std::fs::File;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::strategy::StrategyKind;

const DEFAULT_SEED: u64 = 1633634632;

fn default_seed() -> u64 {
    DEFAULT_SEED
}

fn default_true() -> bool {
    true
}

/// Format of a permutation run configuration file.
#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// how crash states are proposed
    #[serde(default)]
    pub strategy: StrategyKind,
    /// seed for the sampling strategies
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// stop after this many accepted crash states
    #[serde(default)]
    pub max_states: Option<usize>,
    /// stop at the first call that fails to find an unseen state
    #[serde(default = "default_true")]
    pub stop_on_exhaustion: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            strategy: StrategyKind::default(),
            seed: DEFAULT_SEED,
            max_states: None,
            stop_on_exhaustion: true,
        }
    }
}

impl Config {
    pub fn from_path(path: &Path) -> Result<Self> {
        let f = File::open(path).context("could not open config file")?;
        let config: Config = serde_yaml::from_reader(f).context("could not parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would never terminate.
    pub fn validate(&self) -> Result<()> {
        if !self.stop_on_exhaustion && self.max_states.is_none() {
            bail!("max_states is required when stop_on_exhaustion is disabled");
        }
        Ok(())
    }
}
