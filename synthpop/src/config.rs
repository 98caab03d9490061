use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use synthutil::Parallelism;

use crate::households::HouseholdConfig;
use crate::matched::MatchingConfig;
use crate::scaling::ScalingConfig;

/// Settings for a whole synthesis run. Every field has a default, so a config file only needs to
/// list what it changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Every random draw of the run derives from this
    pub random_seed: u64,
    /// Worker threads for partitions and matching chunks. All CPUs if unset.
    pub threads: Option<usize>,
    /// The probability of keeping each household before matching. 1 keeps everyone.
    pub input_downsampling: f64,
    pub scaling: ScalingConfig,
    pub matching: MatchingConfig,
    pub households: HouseholdConfig,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            random_seed: 0,
            threads: None,
            input_downsampling: 1.0,
            scaling: ScalingConfig::default(),
            matching: MatchingConfig::default(),
            households: HouseholdConfig::default(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        let path = path.as_ref();
        let config: Config = synthutil::read_json(path)?;
        config
            .validate()
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == Some(0) {
            bail!("threads must be at least 1");
        }
        if !(self.input_downsampling > 0.0 && self.input_downsampling <= 1.0) {
            bail!(
                "input_downsampling must be in (0, 1], not {}",
                self.input_downsampling
            );
        }
        self.scaling.validate()?;
        self.matching.validate()?;
        self.households.validate()?;
        if self.matching.household_id != self.households.household_id
            || self.matching.person_id != self.households.person_id
        {
            bail!("matching and households must use the same id columns");
        }
        Ok(())
    }

    pub fn parallelism(&self) -> Parallelism {
        Parallelism::from_threads(self.threads)
    }
}
