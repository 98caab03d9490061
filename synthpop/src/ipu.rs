//! Iterative Proportional Updating: rescale per-row expansion factors of a household-structured
//! sample so that weighted totals match household-level and person-level controls at once.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::filters::{selected, Domains, FilterIndex};
use crate::{Code, Table};

/// Every control table must have a real column with this name, holding the target total.
pub const WEIGHT: &str = "weight";

/// A household-level control. Each household satisfying the filter counts once.
#[derive(Clone, Debug)]
pub struct GroupControl {
    pub target: f64,
    /// All rows selected by the control's filter
    rows: Vec<usize>,
    /// The first selected row of each distinct group
    representatives: Vec<usize>,
}

impl GroupControl {
    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    pub fn representatives(&self) -> &[usize] {
        &self.representatives
    }

    fn total(&self, factors: &[f64]) -> f64 {
        self.representatives.iter().map(|r| factors[*r]).sum()
    }
}

/// A person-level control. Correcting it rescales whole households, so that members of one
/// household always share an expansion factor.
#[derive(Clone, Debug)]
pub struct IndividualControl {
    pub target: f64,
    /// Rows selected by the control's filter
    individuals: Vec<usize>,
    /// Every row of every household with at least one selected individual
    group_rows: Vec<usize>,
}

impl IndividualControl {
    fn total(&self, factors: &[f64]) -> f64 {
        self.individuals.iter().map(|r| factors[*r]).sum()
    }
}

/// One independent fitting problem, usually covering a single partition of the sample.
#[derive(Clone, Debug)]
pub struct FittingProblem {
    pub sample: Table,
    pub group_id: String,
    pub group_controls: Vec<GroupControl>,
    pub individual_controls: Vec<IndividualControl>,
}

impl FittingProblem {
    /// Each control table has one row per category combination: categorical columns naming the
    /// combination, plus a `weight` column with the target. All categorical columns of a control
    /// must exist in the sample.
    pub fn new(
        sample: Table,
        group_id: &str,
        group_controls: &[&Table],
        individual_controls: &[&Table],
    ) -> Result<FittingProblem> {
        check_weight_columns(group_controls)?;
        check_weight_columns(individual_controls)?;
        let group_ids = sample.codes(group_id)?;

        let mut groups = Vec::new();
        for control in group_controls {
            for (target, mask) in control_filters(&sample, control)? {
                let rows = selected(&mask);
                let mut seen = BTreeSet::new();
                let representatives = rows
                    .iter()
                    .filter(|r| seen.insert(group_ids[**r]))
                    .cloned()
                    .collect();
                groups.push(GroupControl {
                    target,
                    rows,
                    representatives,
                });
            }
        }

        let mut individuals = Vec::new();
        for control in individual_controls {
            for (target, mask) in control_filters(&sample, control)? {
                let rows = selected(&mask);
                let touched: BTreeSet<Code> = rows.iter().map(|r| group_ids[*r]).collect();
                let group_rows = (0..sample.len())
                    .filter(|r| touched.contains(&group_ids[*r]))
                    .collect();
                individuals.push(IndividualControl {
                    target,
                    individuals: rows,
                    group_rows,
                });
            }
        }

        Ok(FittingProblem {
            sample,
            group_id: group_id.to_string(),
            group_controls: groups,
            individual_controls: individuals,
        })
    }
}

/// Controls without a weight column are a configuration error, caught before any solving.
pub fn check_weight_columns(controls: &[&Table]) -> Result<()> {
    for control in controls {
        if !control.has_reals(WEIGHT) {
            bail!(
                "Each control table must have a {} column, but one only has {:?}",
                WEIGHT,
                control.columns()
            );
        }
    }
    Ok(())
}

/// For every row of a control table, its target weight and the sample rows it selects.
fn control_filters(sample: &Table, control: &Table) -> Result<Vec<(f64, Vec<bool>)>> {
    let columns: Vec<String> = control.code_columns().map(|x| x.to_string()).collect();
    let domains = Domains::union(&columns, &[sample, control])
        .context("control columns must exist in the sample")?;
    let index = FilterIndex::build(sample, &domains)?;
    let weights = control.reals(WEIGHT)?;
    Ok(domains
        .encode(control)?
        .into_iter()
        .zip(weights)
        .map(|(combination, weight)| (*weight, index.mask(&combination)))
        .collect())
}

/// Weighted error measures over one set of controls.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitError {
    /// Σ|total − target| / Σ|target|
    pub wmape: f64,
    /// Σ(|total − target| · |target|) / Σ|target|
    pub wmae: f64,
}

impl FitError {
    fn new<I: Iterator<Item = (f64, f64)>>(totals_and_targets: I) -> FitError {
        let mut nominator_wmape = 0.0;
        let mut nominator_wmae = 0.0;
        let mut denominator = 0.0;
        for (total, target) in totals_and_targets {
            let diff = (total - target).abs();
            nominator_wmape += diff;
            nominator_wmae += diff * target.abs();
            denominator += target.abs();
        }
        if denominator == 0.0 {
            // All targets are zero (or there are no controls at all)
            let err = if nominator_wmape == 0.0 {
                0.0
            } else {
                f64::INFINITY
            };
            return FitError {
                wmape: err,
                wmae: err,
            };
        }
        FitError {
            wmape: nominator_wmape / denominator,
            wmae: nominator_wmae / denominator,
        }
    }

    /// Either measure alone is enough.
    pub fn within(&self, rel_tol: f64, abs_tol: f64) -> bool {
        self.wmape <= rel_tol || self.wmae <= abs_tol
    }
}

/// The result of fitting one problem. Non-convergence is advisory; the factors are usable either
/// way.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fit {
    pub expansion_factors: Vec<f64>,
    pub converged: bool,
    pub iterations: usize,
    pub group_error: FitError,
    pub individual_error: FitError,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpuSolver {
    pub group_rel_tol: f64,
    pub group_abs_tol: f64,
    pub individual_rel_tol: f64,
    pub individual_abs_tol: f64,
    pub max_iterations: usize,
}

impl Default for IpuSolver {
    fn default() -> IpuSolver {
        IpuSolver {
            group_rel_tol: 1e-3,
            group_abs_tol: 10.0,
            individual_rel_tol: 1e-3,
            individual_abs_tol: 10.0,
            max_iterations: 2000,
        }
    }
}

impl IpuSolver {
    /// Alternate household and person fits, checking convergence after each phase, for at most
    /// `max_iterations` rounds. Expansion factors start at 1.
    pub fn fit(&self, problem: &FittingProblem) -> Fit {
        let mut factors = vec![1.0; problem.sample.len()];

        for iteration in 1..=self.max_iterations {
            group_fit(problem, &mut factors);
            if let Some(fit) = self.check(problem, &factors, iteration) {
                return fit;
            }

            individual_fit(problem, &mut factors);
            if let Some(fit) = self.check(problem, &factors, iteration) {
                return fit;
            }
        }

        let (group_error, individual_error) = errors(problem, &factors);
        debug!(
            "IPU didn't converge after {} iterations. Group WMAPE {}, individual WMAPE {}",
            self.max_iterations, group_error.wmape, individual_error.wmape
        );
        Fit {
            expansion_factors: factors,
            converged: false,
            iterations: self.max_iterations,
            group_error,
            individual_error,
        }
    }

    fn check(&self, problem: &FittingProblem, factors: &[f64], iteration: usize) -> Option<Fit> {
        let (group_error, individual_error) = errors(problem, factors);
        if group_error.within(self.group_rel_tol, self.group_abs_tol)
            && individual_error.within(self.individual_rel_tol, self.individual_abs_tol)
        {
            Some(Fit {
                expansion_factors: factors.to_vec(),
                converged: true,
                iterations: iteration,
                group_error,
                individual_error,
            })
        } else {
            None
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            bail!("IPU needs at least one iteration");
        }
        for tol in [
            self.group_rel_tol,
            self.group_abs_tol,
            self.individual_rel_tol,
            self.individual_abs_tol,
        ] {
            if !(tol >= 0.0) {
                bail!("IPU tolerances must be nonnegative, not {}", tol);
            }
        }
        Ok(())
    }
}

/// Current errors against the household and person controls.
pub fn errors(problem: &FittingProblem, factors: &[f64]) -> (FitError, FitError) {
    let group = FitError::new(
        problem
            .group_controls
            .iter()
            .map(|c| (c.total(factors), c.target)),
    );
    let individual = FitError::new(
        problem
            .individual_controls
            .iter()
            .map(|c| (c.total(factors), c.target)),
    );
    (group, individual)
}

// Controls are applied one after another, so later ones see the effect of earlier ones.
fn group_fit(problem: &FittingProblem, factors: &mut [f64]) {
    for control in &problem.group_controls {
        let total = control.total(factors);
        rescale(factors, &control.rows, control.target, total);
    }
}

fn individual_fit(problem: &FittingProblem, factors: &mut [f64]) {
    for control in &problem.individual_controls {
        let total = control.total(factors);
        rescale(factors, &control.group_rows, control.target, total);
    }
}

fn rescale(factors: &mut [f64], rows: &[usize], target: f64, total: f64) {
    // With no current weight there's nothing to scale; 0/0 counts as already satisfied.
    if total <= 0.0 {
        return;
    }
    let ratio = target / total;
    for r in rows {
        factors[*r] *= ratio;
    }
}
