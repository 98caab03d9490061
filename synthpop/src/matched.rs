//! Attach survey observations to a synthetic population in two passes. Household heads are
//! matched first, and their household attributes are shared with everyone in the household. Then
//! every person old enough is matched individually, also keyed on those household attributes.
//! Households that can't be matched under any constraint are removed entirely.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use itertools::Itertools;
use rand_xorshift::XorShiftRng;
use serde::{Deserialize, Serialize};

use synthutil::{prettyprint_usize, Parallelism, Timer};

use crate::matching::{parallel_statistical_matching, Assignment, MatchingSpec};
use crate::{Code, Table};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub minimum_observations: usize,
    /// Use only weekend observations if true, only weekday observations otherwise
    pub weekend_scenario: bool,
    /// Younger persons aren't matched individually
    pub age_threshold: Code,
    /// Targets are matched in chunks of this many rows, each with its own random stream
    pub chunk_size: usize,

    // Population columns
    pub person_id: String,
    pub household_id: String,
    pub age: String,
    pub is_head: String,

    // Source columns
    pub source_id: String,
    /// 1 for weekend observations
    pub weekend: String,
    pub household_weight: String,
    pub person_weight: String,

    /// Keys for matching heads, most significant first
    pub household_columns: Vec<String>,
    /// Taken from the head's match and shared with the household; extra keys for matching
    /// persons
    pub household_attributes: Vec<String>,
}

impl Default for MatchingConfig {
    fn default() -> MatchingConfig {
        MatchingConfig {
            minimum_observations: 20,
            weekend_scenario: false,
            age_threshold: 6,
            chunk_size: 10_000,

            person_id: "person_id".to_string(),
            household_id: "household_id".to_string(),
            age: "age".to_string(),
            is_head: "is_head".to_string(),

            source_id: "person_id".to_string(),
            weekend: "weekend".to_string(),
            household_weight: "household_weight".to_string(),
            person_weight: "person_weight".to_string(),

            household_columns: vec![
                "age_class".to_string(),
                "sex".to_string(),
                "marital_status".to_string(),
                "household_size_class".to_string(),
                "municipality_type".to_string(),
            ],
            household_attributes: vec![
                "income_class".to_string(),
                "number_of_cars_class".to_string(),
                "number_of_bikes_class".to_string(),
            ],
        }
    }
}

impl MatchingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("matching.chunk_size must be at least 1");
        }
        if self.household_columns.is_empty() {
            bail!("matching.household_columns can't be empty");
        }
        if let Some(dupe) = self
            .household_columns
            .iter()
            .chain(&self.household_attributes)
            .duplicates()
            .next()
        {
            bail!("matching key {} is listed twice", dupe);
        }
        Ok(())
    }

    fn household_spec(&self) -> MatchingSpec {
        MatchingSpec {
            source_id: self.source_id.clone(),
            source_weight: self.household_weight.clone(),
            target_id: self.person_id.clone(),
            columns: self.household_columns.clone(),
            minimum_observations: self.minimum_observations,
        }
    }

    fn person_spec(&self) -> MatchingSpec {
        MatchingSpec {
            source_id: self.source_id.clone(),
            source_weight: self.person_weight.clone(),
            target_id: self.person_id.clone(),
            columns: self
                .household_columns
                .iter()
                .chain(&self.household_attributes)
                .cloned()
                .collect(),
            minimum_observations: self.minimum_observations,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonMatch {
    pub person_id: Code,
    pub household_id: Code,
    /// The observation matched to the head of this person's household
    pub head_source_id: Code,
    /// None for persons below the age threshold
    pub person_source_id: Option<Code>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassSummary {
    pub targets: usize,
    /// Targets matched at exactly each level
    pub histogram: Vec<usize>,
    pub removed_households: usize,
    pub removed_persons: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchedPopulation {
    /// Every remaining person, in population order
    pub persons: Vec<PersonMatch>,
    pub removed_person_ids: BTreeSet<Code>,
    pub removed_household_ids: BTreeSet<Code>,
    pub household_pass: PassSummary,
    pub person_pass: PassSummary,
}

/// `population` has one row per person, with the household key columns, age, and an `is_head`
/// flag. `source` has the key columns, household attributes, both weights, and a weekend flag.
pub fn match_population(
    population: &Table,
    source: &Table,
    config: &MatchingConfig,
    rng: &mut XorShiftRng,
    parallelism: Parallelism,
    timer: &mut Timer,
) -> Result<MatchedPopulation> {
    config.validate()?;

    let weekend = if config.weekend_scenario { 1 } else { 0 };
    let source = source.filter(
        &source
            .codes(&config.weekend)?
            .iter()
            .map(|x| *x == weekend)
            .collect::<Vec<_>>(),
    );
    let source_rows: BTreeMap<Code, usize> = source
        .codes(&config.source_id)?
        .iter()
        .enumerate()
        .map(|(row, id)| (*id, row))
        .collect();
    if source_rows.len() != source.len() {
        bail!("source ids in {} aren't unique", config.source_id);
    }
    let initial_households = population.distinct(&config.household_id)?.len();
    let initial_persons = population.len();

    let mut removed_person_ids = BTreeSet::new();
    let mut removed_household_ids = BTreeSet::new();

    // Household heads
    timer.start("match household heads");
    let heads = population.filter(&old_enough(population, config, true)?);
    let spec = config.household_spec();
    let assignment = parallel_statistical_matching(
        &source,
        &heads,
        &spec,
        config.chunk_size,
        rng,
        parallelism,
        timer,
    )
    .context("matching household heads")?;
    report_levels("household heads", &assignment, spec.columns.len());

    let head_households = heads.codes(&config.household_id)?;
    let mut head_source: BTreeMap<Code, Code> = BTreeMap::new();
    let mut unmatchable = BTreeSet::new();
    for (idx, household) in head_households.iter().enumerate() {
        if assignment.levels[idx] < 1 {
            unmatchable.insert(*household);
        } else if head_source
            .insert(*household, assignment.source_ids[idx])
            .is_some()
        {
            bail!("household {} has more than one head", household);
        }
    }
    let (population, household_pass) = remove_households(
        population,
        &unmatchable,
        config,
        &assignment,
        spec.columns.len(),
        &mut removed_person_ids,
        &mut removed_household_ids,
    )?;
    warn_removed("household heads", &household_pass);
    timer.stop("match household heads");

    // Share the head's attributes with the household
    let mut population = population;
    let households = population.codes(&config.household_id)?.to_vec();
    let mut head_ids = Vec::with_capacity(households.len());
    for household in &households {
        match head_source.get(household) {
            Some(id) => head_ids.push(*id),
            None => bail!("household {} has no matched head", household),
        }
    }
    for attribute in &config.household_attributes {
        let values = source.codes(attribute)?;
        let shared = head_ids
            .iter()
            .map(|id| values[source_rows[id]])
            .collect();
        population.set_codes(attribute.clone(), shared)?;
    }

    // Persons
    timer.start("match persons");
    let persons = population.filter(&old_enough(&population, config, false)?);
    let spec = config.person_spec();
    let assignment = parallel_statistical_matching(
        &source,
        &persons,
        &spec,
        config.chunk_size,
        rng,
        parallelism,
        timer,
    )
    .context("matching persons")?;
    report_levels("persons", &assignment, spec.columns.len());

    let person_households = persons.codes(&config.household_id)?;
    let mut person_source: BTreeMap<Code, Code> = BTreeMap::new();
    let mut unmatchable = BTreeSet::new();
    for (idx, (person, household)) in assignment
        .target_ids
        .iter()
        .zip(person_households)
        .enumerate()
    {
        if assignment.levels[idx] < 1 {
            unmatchable.insert(*household);
        } else {
            person_source.insert(*person, assignment.source_ids[idx]);
        }
    }
    let (population, person_pass) = remove_households(
        &population,
        &unmatchable,
        config,
        &assignment,
        spec.columns.len(),
        &mut removed_person_ids,
        &mut removed_household_ids,
    )?;
    warn_removed("persons", &person_pass);
    timer.stop("match persons");

    let person_ids = population.codes(&config.person_id)?;
    let household_ids = population.codes(&config.household_id)?;
    let ages = population.codes(&config.age)?;
    let mut result = Vec::with_capacity(population.len());
    for row in 0..population.len() {
        let person_source_id = person_source.get(&person_ids[row]).cloned();
        ensure!(
            person_source_id.is_some() || ages[row] < config.age_threshold,
            "person {} is old enough, but wasn't matched",
            person_ids[row]
        );
        result.push(PersonMatch {
            person_id: person_ids[row],
            household_id: household_ids[row],
            head_source_id: head_source[&household_ids[row]],
            person_source_id,
        });
    }

    timer.note(format!(
        "Matching removed {} of {} households ({:.2}%) and {} of {} persons ({:.2}%)",
        prettyprint_usize(removed_household_ids.len()),
        prettyprint_usize(initial_households),
        percent(removed_household_ids.len(), initial_households),
        prettyprint_usize(removed_person_ids.len()),
        prettyprint_usize(initial_persons),
        percent(removed_person_ids.len(), initial_persons),
    ));

    Ok(MatchedPopulation {
        persons: result,
        removed_person_ids,
        removed_household_ids,
        household_pass,
        person_pass,
    })
}

impl MatchedPopulation {
    /// The remaining persons, in match order, with source columns attached. Household attributes
    /// come from the head's observation and `person_columns` from the person's own. Persons
    /// without their own observation get `child_default` for every person column.
    pub fn enrich(
        &self,
        population: &Table,
        source: &Table,
        config: &MatchingConfig,
        person_columns: &[String],
        child_default: Code,
    ) -> Result<Table> {
        let population_rows: BTreeMap<Code, usize> = population
            .codes(&config.person_id)?
            .iter()
            .enumerate()
            .map(|(row, id)| (*id, row))
            .collect();
        let source_rows: BTreeMap<Code, usize> = source
            .codes(&config.source_id)?
            .iter()
            .enumerate()
            .map(|(row, id)| (*id, row))
            .collect();

        let mut rows = Vec::with_capacity(self.persons.len());
        let mut head_rows = Vec::with_capacity(self.persons.len());
        let mut person_rows = Vec::with_capacity(self.persons.len());
        for person in &self.persons {
            rows.push(*population_rows.get(&person.person_id).ok_or_else(|| {
                anyhow!("person {} isn't in the population", person.person_id)
            })?);
            head_rows.push(lookup(&source_rows, person.head_source_id)?);
            person_rows.push(match person.person_source_id {
                Some(id) => Some(lookup(&source_rows, id)?),
                None => None,
            });
        }

        let mut table = population.take(&rows);
        table.set_codes(
            "head_source_id",
            self.persons.iter().map(|p| p.head_source_id).collect(),
        )?;
        table.set_codes(
            "person_source_id",
            self.persons
                .iter()
                .map(|p| p.person_source_id.unwrap_or(-1))
                .collect(),
        )?;
        for attribute in &config.household_attributes {
            let values = source.codes(attribute)?;
            table.set_codes(
                attribute.clone(),
                head_rows.iter().map(|r| values[*r]).collect(),
            )?;
        }
        for column in person_columns {
            let values = source.codes(column)?;
            table.set_codes(
                column.clone(),
                person_rows
                    .iter()
                    .map(|r| r.map(|r| values[r]).unwrap_or(child_default))
                    .collect(),
            )?;
        }
        Ok(table)
    }
}

fn lookup(rows: &BTreeMap<Code, usize>, id: Code) -> Result<usize> {
    rows.get(&id)
        .cloned()
        .ok_or_else(|| anyhow!("source observation {} doesn't exist", id))
}

// Rows old enough to match. For heads, also only the flagged head of each household.
fn old_enough(population: &Table, config: &MatchingConfig, heads_only: bool) -> Result<Vec<bool>> {
    let ages = population.codes(&config.age)?;
    let mut mask: Vec<bool> = ages.iter().map(|a| *a >= config.age_threshold).collect();
    if heads_only {
        for (x, head) in mask.iter_mut().zip(population.codes(&config.is_head)?) {
            *x &= *head == 1;
        }
    }
    Ok(mask)
}

// Drop every member of the given households, recording what was removed.
fn remove_households(
    population: &Table,
    households: &BTreeSet<Code>,
    config: &MatchingConfig,
    assignment: &Assignment,
    num_columns: usize,
    removed_person_ids: &mut BTreeSet<Code>,
    removed_household_ids: &mut BTreeSet<Code>,
) -> Result<(Table, PassSummary)> {
    let household_ids = population.codes(&config.household_id)?;
    let person_ids = population.codes(&config.person_id)?;
    let mut keep = Vec::with_capacity(population.len());
    let mut removed_persons = 0;
    for (household, person) in household_ids.iter().zip(person_ids) {
        if households.contains(household) {
            removed_person_ids.insert(*person);
            removed_persons += 1;
            keep.push(false);
        } else {
            keep.push(true);
        }
    }
    removed_household_ids.extend(households.iter().cloned());
    let summary = PassSummary {
        targets: assignment.len(),
        histogram: assignment.histogram(num_columns),
        removed_households: households.len(),
        removed_persons,
    };
    Ok((population.filter(&keep), summary))
}

fn report_levels(name: &str, assignment: &Assignment, num_columns: usize) {
    let total = assignment.len();
    info!(
        "Matched {} {}. Rows matched on at least each number of keys: {}",
        prettyprint_usize(total),
        name,
        assignment
            .cumulative(num_columns)
            .iter()
            .enumerate()
            .map(|(level, count)| format!("{}: {:.2}%", level, percent(*count, total)))
            .join(", ")
    );
}

fn warn_removed(name: &str, summary: &PassSummary) {
    if summary.removed_households > 0 {
        warn!(
            "{} unmatchable {}: removed {} households with {} persons",
            prettyprint_usize(summary.histogram[0]),
            name,
            prettyprint_usize(summary.removed_households),
            prettyprint_usize(summary.removed_persons)
        );
    }
}

fn percent(count: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    100.0 * (count as f64) / (total as f64)
}
