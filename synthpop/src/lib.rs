//! Synthetic population generation: fit a household survey sample to population controls, turn
//! it into an integer population, and attach detailed survey observations to every person through
//! hierarchical statistical matching.

#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate log;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use synthutil::{fork_rng, prettyprint_usize, seeded_rng, Timer};

pub use self::config::Config;
pub use self::households::{
    age_class, derive_classes, downsample_households, drop_large_households,
    drop_underage_households, household_size_class, household_sizes, impute_heads,
    HouseholdConfig,
};
pub use self::integerize::{truncate_replicate_sample, Replica};
pub use self::ipu::{Fit, FitError, FittingProblem, IpuSolver};
pub use self::matched::{
    match_population, MatchedPopulation, MatchingConfig, PassSummary, PersonMatch,
};
pub use self::matching::{
    parallel_statistical_matching, statistical_matching, Assignment, MatchingSpec,
};
pub use self::scaling::{
    prepare_size_classes, scale_population, PartitionSummary, ScaledPopulation, ScalingConfig,
};
pub use self::table::{Code, Table};

mod config;
pub mod filters;
mod households;
mod integerize;
pub mod ipu;
mod matched;
mod matching;
mod scaling;
mod table;

/// Marginal totals to scale the sample to. Both tables have the partition column, categorical
/// columns matching the sample, and a `weight` column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Controls {
    pub households: Table,
    pub persons: Table,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SynthesisInputs {
    /// One row per person, grouped into households
    pub population: Table,
    /// Without controls, the population is matched as it is
    pub controls: Option<Controls>,
    /// Weighted survey observations to attach to persons
    pub source: Table,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Synthesis {
    /// The population that went into matching, with derived classes and heads, after scaling and
    /// downsampling
    pub population: Table,
    /// Per-partition diagnostics, if the population was scaled
    pub partitions: Option<Vec<PartitionSummary>>,
    pub matched: MatchedPopulation,
}

/// Prepare households, optionally scale to the controls, downsample, then match in two passes.
pub fn synthesize(inputs: &SynthesisInputs, config: &Config, timer: &mut Timer) -> Result<Synthesis> {
    config.validate()?;
    let mut rng = seeded_rng(config.random_seed);
    let parallelism = config.parallelism();

    timer.start("prepare households");
    let population = drop_large_households(&inputs.population, &config.households)?;
    let mut population = drop_underage_households(&population, &config.households)?;
    derive_classes(&mut population, &config.households)?;
    impute_heads(&mut population, &config.households)?;
    timer.stop("prepare households");

    let mut partitions = None;
    if let Some(ref controls) = inputs.controls {
        timer.start("scale population");
        let result = scale_population(
            &population,
            &controls.households,
            &controls.persons,
            &config.scaling,
            &mut rng,
            parallelism,
            timer,
        )?;
        timer.stop("scale population");
        population = result.population;
        partitions = Some(result.partitions);
    }

    let population = downsample_households(
        &population,
        &config.households.household_id,
        config.input_downsampling,
        &mut fork_rng(&mut rng),
    )?;

    let matched = match_population(
        &population,
        &inputs.source,
        &config.matching,
        &mut rng,
        parallelism,
        timer,
    )?;
    info!(
        "Synthesized {} persons",
        prettyprint_usize(matched.persons.len())
    );

    Ok(Synthesis {
        population,
        partitions,
        matched,
    })
}
