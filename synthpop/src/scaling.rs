//! Scale a survey sample up to a full, integer synthetic population. Every partition (usually a
//! canton) is an independent fitting problem; they're solved in parallel and merged with globally
//! unique ids.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use rand_xorshift::XorShiftRng;
use serde::{Deserialize, Serialize};

use synthutil::{fork_rng, prettyprint_usize, Parallelism, Timer};

use crate::households::household_sizes;
use crate::integerize::{truncate_replicate_sample, Replica};
use crate::ipu::{check_weight_columns, FitError, FittingProblem, IpuSolver};
use crate::{Code, Table};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    /// Splits the sample and both control tables into independent problems
    pub partition: String,
    pub household_id: String,
    pub person_id: String,
    /// If set, this household size class column is derived for the sample from the number of
    /// classes in the household controls before fitting
    pub size_class_projection: Option<String>,
    pub solver: IpuSolver,
}

impl Default for ScalingConfig {
    fn default() -> ScalingConfig {
        ScalingConfig {
            partition: "canton_id".to_string(),
            household_id: "household_id".to_string(),
            person_id: "person_id".to_string(),
            size_class_projection: None,
            solver: IpuSolver {
                group_rel_tol: 1e-4,
                group_abs_tol: 1.0,
                individual_rel_tol: 1e-5,
                individual_abs_tol: 10.0,
                max_iterations: 2000,
            },
        }
    }
}

impl ScalingConfig {
    pub fn validate(&self) -> Result<()> {
        for (field, column) in [
            ("partition", &self.partition),
            ("household_id", &self.household_id),
            ("person_id", &self.person_id),
        ] {
            if column.is_empty() {
                bail!("scaling.{} must name a column", field);
            }
        }
        self.solver.validate()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartitionSummary {
    pub partition: Code,
    pub converged: bool,
    pub iterations: usize,
    pub group_error: FitError,
    pub individual_error: FitError,
    /// Households after integerization
    pub households: usize,
    /// How many of those came from sampling the remainders
    pub sampled_households: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScaledPopulation {
    /// One row per synthetic person. `household_id` and `person_id` are renumbered from 1;
    /// `original_household_id` and `original_person_id` point back into the sample.
    pub population: Table,
    pub partitions: Vec<PartitionSummary>,
}

impl ScaledPopulation {
    /// The fraction of partitions whose fit converged.
    pub fn convergence_rate(&self) -> f64 {
        if self.partitions.is_empty() {
            return 1.0;
        }
        let converged = self.partitions.iter().filter(|p| p.converged).count();
        (converged as f64) / (self.partitions.len() as f64)
    }
}

/// Everything one worker needs for one partition.
struct ScalingTask {
    partition: Code,
    problem: FittingProblem,
    solver: IpuSolver,
    rng: XorShiftRng,
}

struct PartitionResult {
    summary: PartitionSummary,
    sample: Table,
    replicas: Vec<Replica>,
}

impl ScalingTask {
    fn run(mut self) -> Result<PartitionResult> {
        let fit = self.solver.fit(&self.problem);
        let replicas = truncate_replicate_sample(&self.problem, &fit, &mut self.rng)
            .with_context(|| format!("integerizing partition {}", self.partition))?;
        Ok(PartitionResult {
            summary: PartitionSummary {
                partition: self.partition,
                converged: fit.converged,
                iterations: fit.iterations,
                group_error: fit.group_error,
                individual_error: fit.individual_error,
                households: replicas.len(),
                sampled_households: replicas.iter().filter(|r| r.sampled).count(),
            },
            sample: self.problem.sample,
            replicas,
        })
    }
}

/// `sample` has one row per person. Both control tables carry the partition column, categorical
/// columns that also exist in the sample, and a `weight` column. The person control table may be
/// empty.
pub fn scale_population(
    sample: &Table,
    household_controls: &Table,
    person_controls: &Table,
    config: &ScalingConfig,
    rng: &mut XorShiftRng,
    parallelism: Parallelism,
    timer: &mut Timer,
) -> Result<ScaledPopulation> {
    check_weight_columns(&[household_controls, person_controls])?;
    config.validate()?;

    timer.start("prepare fitting problems");
    let mut sample = sample.clone();
    if let Some(column) = &config.size_class_projection {
        prepare_size_classes(&mut sample, household_controls, &config.household_id, column)?;
    }
    let partitions = sample.distinct(&config.partition)?;
    let household_partitions = household_controls.distinct(&config.partition)?;
    for p in &household_partitions {
        if partitions.binary_search(p).is_err() {
            timer.warn(format!(
                "Household controls for partition {} have no sample rows",
                p
            ));
        }
    }

    let mut tasks = Vec::new();
    for partition in partitions {
        let part_sample = only_partition(&sample, &config.partition, partition, false)?;
        let part_households =
            only_partition(household_controls, &config.partition, partition, true)?;
        let part_persons = only_partition(person_controls, &config.partition, partition, true)?;
        if part_households.is_empty() {
            bail!("Partition {} has no household controls", partition);
        }
        let mut individual_controls = Vec::new();
        if !part_persons.is_empty() {
            individual_controls.push(&part_persons);
        }
        let problem = FittingProblem::new(
            part_sample,
            &config.household_id,
            &[&part_households],
            &individual_controls,
        )
        .with_context(|| format!("building the fitting problem for partition {}", partition))?;
        debug!(
            "Partition {}: {} sample rows, {} household controls, {} person controls",
            partition,
            prettyprint_usize(problem.sample.len()),
            problem.group_controls.len(),
            problem.individual_controls.len()
        );
        tasks.push(ScalingTask {
            partition,
            problem,
            solver: config.solver.clone(),
            rng: fork_rng(rng),
        });
    }
    timer.stop("prepare fitting problems");

    let results = timer
        .parallelize(
            "fit and integerize partitions",
            parallelism,
            tasks,
            |task: ScalingTask| task.run(),
        )
        .into_iter()
        .collect::<Result<Vec<_>>>()?;

    timer.start("merge partitions");
    let mut next_household = 0;
    let mut tables = Vec::new();
    let mut summaries = Vec::new();
    for result in results {
        if !result.summary.converged {
            timer.warn(format!(
                "Partition {} didn't converge after {} iterations (group WMAPE {}, individual WMAPE {})",
                result.summary.partition,
                result.summary.iterations,
                result.summary.group_error.wmape,
                result.summary.individual_error.wmape
            ));
        }
        tables.push(expand_replicas(&result, config, &mut next_household)?);
        summaries.push(result.summary);
    }
    let mut population = Table::concat(tables)?;
    population.set_codes(
        config.person_id.clone(),
        (1..=population.len() as Code).collect(),
    )?;
    timer.stop("merge partitions");

    let scaled = ScaledPopulation {
        population,
        partitions: summaries,
    };
    info!(
        "Scaled to {} households and {} persons. {:.1}% of {} partitions converged",
        prettyprint_usize(next_household as usize),
        prettyprint_usize(scaled.population.len()),
        100.0 * scaled.convergence_rate(),
        scaled.partitions.len()
    );
    Ok(scaled)
}

fn only_partition(table: &Table, column: &str, partition: Code, drop_column: bool) -> Result<Table> {
    let mask: Vec<bool> = table.codes(column)?.iter().map(|x| *x == partition).collect();
    let mut result = table.filter(&mask);
    if drop_column {
        result.remove(column);
    }
    Ok(result)
}

// Replicas become households numbered after `next_household`. Members keep their order by
// original person id, so sorting by (household, original person) is just the emitted order.
fn expand_replicas(
    result: &PartitionResult,
    config: &ScalingConfig,
    next_household: &mut Code,
) -> Result<Table> {
    let sample = &result.sample;
    let household_ids = sample.codes(&config.household_id)?;
    let person_ids = sample.codes(&config.person_id)?;

    let mut members: BTreeMap<Code, Vec<usize>> = BTreeMap::new();
    for (row, household) in household_ids.iter().enumerate() {
        members.entry(*household).or_insert_with(Vec::new).push(row);
    }
    for rows in members.values_mut() {
        rows.sort_by_key(|r| person_ids[*r]);
    }

    let mut rows = Vec::new();
    let mut new_household_ids = Vec::new();
    for replica in &result.replicas {
        *next_household += 1;
        let replica_rows = members.get(&replica.original_group).ok_or_else(|| {
            anyhow!(
                "household {} was replicated, but isn't in the sample",
                replica.original_group
            )
        })?;
        for row in replica_rows {
            rows.push(*row);
            new_household_ids.push(*next_household);
        }
    }

    let mut table = sample.take(&rows);
    let original_households = table.codes(&config.household_id)?.to_vec();
    let original_persons = table.codes(&config.person_id)?.to_vec();
    table.set_codes("original_household_id", original_households)?;
    table.set_codes("original_person_id", original_persons)?;
    table.set_codes(config.household_id.clone(), new_household_ids)?;
    Ok(table)
}

/// The household size classes in the controls may be coarser than the sample's. Adds
/// `class_column` to the sample as `min(n_classes, household size) − 1`, where `n_classes` is the
/// number of distinct classes in the household controls.
pub fn prepare_size_classes(
    sample: &mut Table,
    household_controls: &Table,
    household_id: &str,
    class_column: &str,
) -> Result<()> {
    let n_classes = household_controls.distinct(class_column)?.len() as Code;
    if n_classes == 0 {
        bail!("Household controls have no {} values", class_column);
    }
    let classes = household_sizes(sample, household_id)?
        .into_iter()
        .map(|size| size.min(n_classes) - 1)
        .collect();
    sample.set_codes(class_column, classes)
}

#[cfg(test)]
mod tests {
    use synthutil::seeded_rng;

    use super::*;
    use crate::ipu::WEIGHT;

    // Partition 1: a single (household 1) and a couple (household 2).
    // Partition 2: one single (household 3).
    fn sample() -> Table {
        Table::new(4)
            .with_codes("canton_id", vec![1, 1, 1, 2])
            .unwrap()
            .with_codes("household_id", vec![1, 2, 2, 3])
            .unwrap()
            .with_codes("person_id", vec![11, 22, 21, 31])
            .unwrap()
            .with_codes("household_size_class", vec![0, 1, 1, 0])
            .unwrap()
            .with_codes("sex", vec![0, 0, 1, 1])
            .unwrap()
    }

    fn household_controls() -> Table {
        Table::new(3)
            .with_codes("canton_id", vec![1, 1, 2])
            .unwrap()
            .with_codes("household_size_class", vec![0, 1, 0])
            .unwrap()
            .with_reals(WEIGHT, vec![2.0, 3.0, 4.0])
            .unwrap()
    }

    fn no_person_controls() -> Table {
        Table::new(0)
            .with_codes("canton_id", Vec::new())
            .unwrap()
            .with_reals(WEIGHT, Vec::new())
            .unwrap()
    }

    fn scale(household_controls: &Table, parallelism: Parallelism) -> Result<ScaledPopulation> {
        scale_population(
            &sample(),
            household_controls,
            &no_person_controls(),
            &ScalingConfig::default(),
            &mut seeded_rng(42),
            parallelism,
            &mut Timer::throwaway(),
        )
    }

    #[test]
    fn integer_targets_replicate_exactly() {
        let scaled = scale(&household_controls(), Parallelism::Threads(2)).unwrap();
        assert_eq!(scaled.partitions.len(), 2);
        assert_eq!(scaled.convergence_rate(), 1.0);
        assert_eq!(scaled.partitions[0].households, 5);
        assert_eq!(scaled.partitions[1].households, 4);

        let pop = &scaled.population;
        // 2 singles + 3 couples + 4 singles
        assert_eq!(pop.len(), 12);
        assert_eq!(
            pop.codes("household_id").unwrap(),
            &[1, 2, 3, 3, 4, 4, 5, 5, 6, 7, 8, 9]
        );
        assert_eq!(pop.codes("person_id").unwrap(), &(1..=12).collect::<Vec<_>>()[..]);
        assert_eq!(
            pop.codes("original_household_id").unwrap(),
            &[1, 1, 2, 2, 2, 2, 2, 2, 3, 3, 3, 3]
        );
        // Members ordered by original person id
        assert_eq!(
            &pop.codes("original_person_id").unwrap()[2..4],
            &[21, 22]
        );
        assert_eq!(pop.codes("canton_id").unwrap()[11], 2);
    }

    #[test]
    fn missing_weight_fails_before_solving() {
        let mut bad = household_controls();
        bad.remove(WEIGHT);
        assert!(scale(&bad, Parallelism::Threads(1)).is_err());
    }

    #[test]
    fn partition_without_household_controls_is_fatal() {
        let only_first = household_controls().take(&[0, 1]);
        assert!(scale(&only_first, Parallelism::Threads(1)).is_err());
    }

    #[test]
    fn one_failing_partition_fails_the_batch() {
        // A negative target gives household 3 a negative expansion factor, which can't be
        // integerized. Partition 1 is fine on its own.
        let mut controls = household_controls();
        controls.set_reals(WEIGHT, vec![2.0, 3.0, -4.0]).unwrap();
        for threads in [1, 2] {
            let err = scale(&controls, Parallelism::Threads(threads)).unwrap_err();
            assert!(format!("{:#}", err).contains("partition 2"));
        }
    }

    #[test]
    fn thread_count_does_not_change_integer_results() {
        let a = scale(&household_controls(), Parallelism::Threads(1)).unwrap();
        let b = scale(&household_controls(), Parallelism::Threads(4)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn size_classes_follow_the_controls() {
        let mut sample = sample();
        let controls = Table::new(1)
            .with_codes("canton_id", vec![1])
            .unwrap()
            .with_codes("projected_size_class", vec![0])
            .unwrap()
            .with_reals(WEIGHT, vec![1.0])
            .unwrap();
        prepare_size_classes(&mut sample, &controls, "household_id", "projected_size_class")
            .unwrap();
        // Only one class in the controls, so everyone is capped to it
        assert_eq!(
            sample.codes("projected_size_class").unwrap(),
            &[0, 0, 0, 0]
        );

        prepare_size_classes(
            &mut sample,
            &household_controls(),
            "household_id",
            "household_size_class",
        )
        .unwrap();
        assert_eq!(
            sample.codes("household_size_class").unwrap(),
            &[0, 1, 1, 0]
        );
    }
}
