//! Household-level attributes of a person table: sizes, size and age classes, and the head of
//! household.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use rand::Rng;
use rand_xorshift::XorShiftRng;
use serde::{Deserialize, Serialize};

use synthutil::prettyprint_usize;

use crate::{Code, Table};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HouseholdConfig {
    pub household_id: String,
    pub person_id: String,
    pub age: String,
    pub sex: String,
    pub marital_status: String,

    /// Households where everyone is younger are dropped, and nobody younger can be the head
    pub minimum_age: Code,
    /// Larger households are dropped
    pub maximum_household_size: Code,
    /// If a household has any candidate at most this old, older candidates can't be the head
    pub active_age: Code,
    /// The marital status code for married people
    pub married: Code,
    /// A person's age class is the number of these bounds at or below their age
    pub age_class_upper_bounds: Vec<Code>,
    /// Households with more than `maximum_household_size_class + 1` people share the last class
    pub maximum_household_size_class: Code,
}

impl Default for HouseholdConfig {
    fn default() -> HouseholdConfig {
        HouseholdConfig {
            household_id: "household_id".to_string(),
            person_id: "person_id".to_string(),
            age: "age".to_string(),
            sex: "sex".to_string(),
            marital_status: "marital_status".to_string(),

            minimum_age: 16,
            maximum_household_size: 12,
            active_age: 65,
            married: 1,
            age_class_upper_bounds: vec![6, 15, 18, 25, 35, 45, 55, 65, 75, 85],
            maximum_household_size_class: 4,
        }
    }
}

impl HouseholdConfig {
    pub fn validate(&self) -> Result<()> {
        if self.minimum_age > self.active_age {
            bail!(
                "households.minimum_age {} is above active_age {}",
                self.minimum_age,
                self.active_age
            );
        }
        if self
            .age_class_upper_bounds
            .windows(2)
            .any(|pair| pair[0] >= pair[1])
        {
            bail!(
                "households.age_class_upper_bounds must be strictly increasing, not {:?}",
                self.age_class_upper_bounds
            );
        }
        if self.maximum_household_size < 1 {
            bail!("households.maximum_household_size must be at least 1");
        }
        if self.maximum_household_size_class < 0 {
            bail!("households.maximum_household_size_class can't be negative");
        }
        Ok(())
    }
}

/// The number of people in each person's household.
pub fn household_sizes(population: &Table, household_id: &str) -> Result<Vec<Code>> {
    let ids = population.codes(household_id)?;
    let mut sizes: BTreeMap<Code, Code> = BTreeMap::new();
    for id in ids {
        *sizes.entry(*id).or_insert(0) += 1;
    }
    Ok(ids.iter().map(|id| sizes[id]).collect())
}

/// Sizes `1..=max_class` map to `0..max_class`; anything larger joins the last class.
pub fn household_size_class(size: Code, max_class: Code) -> Code {
    (max_class + 1).min(size) - 1
}

/// The number of bounds at or below `age`.
pub fn age_class(age: Code, upper_bounds: &[Code]) -> Code {
    upper_bounds.partition_point(|bound| *bound <= age) as Code
}

/// Adds `household_size`, `household_size_class` and `age_class` columns.
pub fn derive_classes(population: &mut Table, config: &HouseholdConfig) -> Result<()> {
    let sizes = household_sizes(population, &config.household_id)?;
    let size_classes = sizes
        .iter()
        .map(|size| household_size_class(*size, config.maximum_household_size_class))
        .collect();
    let age_classes = population
        .codes(&config.age)?
        .iter()
        .map(|age| age_class(*age, &config.age_class_upper_bounds))
        .collect();
    population.set_codes("household_size", sizes)?;
    population.set_codes("household_size_class", size_classes)?;
    population.set_codes("age_class", age_classes)?;
    Ok(())
}

/// Removes every household where all members are younger than `minimum_age`.
pub fn drop_underage_households(population: &Table, config: &HouseholdConfig) -> Result<Table> {
    let households = population.codes(&config.household_id)?;
    let ages = population.codes(&config.age)?;
    let mut has_adult: BTreeMap<Code, bool> = BTreeMap::new();
    for (household, age) in households.iter().zip(ages) {
        *has_adult.entry(*household).or_insert(false) |= *age >= config.minimum_age;
    }
    let mask: Vec<bool> = households.iter().map(|h| has_adult[h]).collect();
    let dropped = has_adult.values().filter(|x| !**x).count();
    if dropped > 0 {
        info!(
            "Dropped {} households without anybody aged {} or older",
            dropped, config.minimum_age
        );
    }
    Ok(population.filter(&mask))
}

/// Removes every household with more than `maximum_household_size` members.
pub fn drop_large_households(population: &Table, config: &HouseholdConfig) -> Result<Table> {
    let sizes = household_sizes(population, &config.household_id)?;
    let mask: Vec<bool> = sizes
        .iter()
        .map(|size| *size <= config.maximum_household_size)
        .collect();
    let dropped: BTreeSet<Code> = population
        .codes(&config.household_id)?
        .iter()
        .zip(&mask)
        .filter(|(_, keep)| !**keep)
        .map(|(household, _)| *household)
        .collect();
    if !dropped.is_empty() {
        info!(
            "Dropped {} households with more than {} members",
            dropped.len(),
            config.maximum_household_size
        );
    }
    Ok(population.filter(&mask))
}

/// Keeps each household with the given probability, drawn once per household in id order.
/// Members always stay together.
pub fn downsample_households(
    population: &Table,
    household_id: &str,
    probability: f64,
    rng: &mut XorShiftRng,
) -> Result<Table> {
    if !(probability > 0.0 && probability <= 1.0) {
        bail!("downsampling probability must be in (0, 1], not {}", probability);
    }
    if probability == 1.0 {
        return Ok(population.clone());
    }

    let households = population.distinct(household_id)?;
    info!(
        "Downsampling to {}: {} households and {} persons before",
        probability,
        prettyprint_usize(households.len()),
        prettyprint_usize(population.len())
    );
    let kept: BTreeSet<Code> = households
        .into_iter()
        .filter(|_| rng.gen::<f64>() < probability)
        .collect();
    let mask: Vec<bool> = population
        .codes(household_id)?
        .iter()
        .map(|h| kept.contains(h))
        .collect();
    let result = population.filter(&mask);
    info!(
        "Downsampled to {} households and {} persons",
        prettyprint_usize(kept.len()),
        prettyprint_usize(result.len())
    );
    Ok(result)
}

/// Adds an `is_head` 0/1 column with one head per household, chosen among members at least
/// `minimum_age` old:
///
/// 1) If anybody is at most `active_age`, only they are considered.
/// 2) If any of those is married, only married people are considered.
/// 3) The oldest wins, then the lowest sex code, then the lowest person id.
///
/// Households without any candidate get no head.
pub fn impute_heads(population: &mut Table, config: &HouseholdConfig) -> Result<()> {
    let households = population.codes(&config.household_id)?;
    let persons = population.codes(&config.person_id)?;
    let ages = population.codes(&config.age)?;
    let sexes = population.codes(&config.sex)?;
    let marital = population.codes(&config.marital_status)?;

    let mut candidates: BTreeMap<Code, Vec<usize>> = BTreeMap::new();
    for row in 0..population.len() {
        if ages[row] >= config.minimum_age {
            candidates.entry(households[row]).or_insert_with(Vec::new).push(row);
        }
    }

    let mut is_head = vec![0; population.len()];
    for rows in candidates.values_mut() {
        if rows.iter().any(|r| ages[*r] <= config.active_age) {
            rows.retain(|r| ages[*r] <= config.active_age);
        }
        if rows.iter().any(|r| marital[*r] == config.married) {
            rows.retain(|r| marital[*r] == config.married);
        }
        let head = rows
            .iter()
            .min_by_key(|r| (std::cmp::Reverse(ages[**r]), sexes[**r], persons[**r]));
        if let Some(head) = head {
            is_head[*head] = 1;
        }
    }

    let headless = households.iter().collect::<BTreeSet<_>>().len()
        - candidates.len();
    if headless > 0 {
        warn!("{} households have no head", headless);
    }
    population.set_codes("is_head", is_head)
}
