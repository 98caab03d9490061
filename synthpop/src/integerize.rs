use anyhow::Result;
use rand::seq::index::sample_weighted;
use rand_xorshift::XorShiftRng;
use serde::{Deserialize, Serialize};

use crate::ipu::{Fit, FittingProblem};
use crate::Code;

/// One physical household of the integer population.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    /// The household id in the sample this is a copy of
    pub original_group: Code,
    /// False for the whole-number copies, true for the ones drawn from the remainders
    pub sampled: bool,
}

/// Truncate-Replicate-Sample. Per household control, every household gets `floor(w)` copies, then
/// `round(Σw − Σfloor(w))` more distinct households are drawn without replacement, with
/// probability proportional to their remainders. Half-way totals round to even.
pub fn truncate_replicate_sample(
    problem: &FittingProblem,
    fit: &Fit,
    rng: &mut XorShiftRng,
) -> Result<Vec<Replica>> {
    let group_ids = problem.sample.codes(&problem.group_id)?;
    let factors = &fit.expansion_factors;
    if factors.len() != group_ids.len() {
        bail!(
            "{} expansion factors for a sample of {} rows",
            factors.len(),
            group_ids.len()
        );
    }

    let mut replicas = Vec::new();
    for control in &problem.group_controls {
        // One factor per household
        let groups: Vec<(Code, f64)> = control
            .representatives()
            .iter()
            .map(|r| (group_ids[*r], factors[*r]))
            .collect();

        let mut total = 0.0;
        let mut truncated = 0.0;
        let mut candidates = Vec::new();
        for (id, weight) in &groups {
            if !(*weight >= 0.0) {
                bail!("household {} has expansion factor {}", id, weight);
            }
            let count = weight.floor();
            total += *weight;
            truncated += count;
            for _ in 0..(count as usize) {
                replicas.push(Replica {
                    original_group: *id,
                    sampled: false,
                });
            }
            let remainder = *weight - count;
            if remainder > 0.0 {
                candidates.push((*id, remainder));
            }
        }

        let amount = ((total - truncated).round_ties_even() as usize).min(candidates.len());
        if amount == 0 {
            continue;
        }
        let mut picks = sample_weighted(rng, candidates.len(), |i| candidates[i].1, amount)
            .map_err(|err| anyhow!("can't sample {} remainder households: {}", amount, err))?
            .into_vec();
        picks.sort_unstable();
        for idx in picks {
            replicas.push(Replica {
                original_group: candidates[idx].0,
                sampled: true,
            });
        }
    }
    Ok(replicas)
}

#[cfg(test)]
mod tests {
    use synthutil::seeded_rng;

    use super::*;
    use crate::ipu::{FitError, WEIGHT};
    use crate::Table;

    // Four single-person households and one couple, all in one size class
    fn problem() -> FittingProblem {
        let sample = Table::new(6)
            .with_codes("household_id", vec![10, 20, 30, 40, 50, 50])
            .unwrap()
            .with_codes("municipality_type", vec![1, 1, 1, 1, 1, 1])
            .unwrap();
        let control = Table::new(1)
            .with_codes("municipality_type", vec![1])
            .unwrap()
            .with_reals(WEIGHT, vec![0.0])
            .unwrap();
        FittingProblem::new(sample, "household_id", &[&control], &[]).unwrap()
    }

    fn fit(expansion_factors: Vec<f64>) -> Fit {
        let no_error = FitError {
            wmape: 0.0,
            wmae: 0.0,
        };
        Fit {
            expansion_factors,
            converged: true,
            iterations: 1,
            group_error: no_error,
            individual_error: no_error,
        }
    }

    #[test]
    fn count_is_rounded_total_and_truncation_is_stable() {
        let problem = problem();
        let weights = fit(vec![2.4, 1.3, 0.5, 3.0, 1.7, 1.7]);
        // Σw = 2.4 + 1.3 + 0.5 + 3.0 + 1.7 = 8.9, Σfloor = 7
        let mut truncated_runs = Vec::new();
        for seed in 0..20 {
            let replicas =
                truncate_replicate_sample(&problem, &weights, &mut seeded_rng(seed)).unwrap();
            assert_eq!(replicas.len(), 9);

            let truncated: Vec<Code> = replicas
                .iter()
                .filter(|r| !r.sampled)
                .map(|r| r.original_group)
                .collect();
            truncated_runs.push(truncated);

            let sampled: Vec<Code> = replicas
                .iter()
                .filter(|r| r.sampled)
                .map(|r| r.original_group)
                .collect();
            assert_eq!(sampled.len(), 2);
            // Without replacement, and only households with a remainder
            assert_ne!(sampled[0], sampled[1]);
            assert!(!sampled.contains(&40));
        }
        assert_eq!(truncated_runs[0], vec![10, 10, 20, 40, 40, 40, 50]);
        assert!(truncated_runs.iter().all(|x| *x == truncated_runs[0]));
    }

    #[test]
    fn whole_weights_skip_the_draw() {
        let replicas = truncate_replicate_sample(
            &problem(),
            &fit(vec![1.0, 0.0, 2.0, 1.0, 3.0, 3.0]),
            &mut seeded_rng(42),
        )
        .unwrap();
        assert_eq!(replicas.len(), 7);
        assert!(replicas.iter().all(|r| !r.sampled));
    }

    #[test]
    fn zero_weight_households_are_never_drawn() {
        for seed in 0..20 {
            let replicas = truncate_replicate_sample(
                &problem(),
                &fit(vec![0.0, 0.6, 0.0, 0.0, 0.5, 0.5]),
                &mut seeded_rng(seed),
            )
            .unwrap();
            // round(1.1) = 1
            assert_eq!(replicas.len(), 1);
            assert!(replicas[0].original_group == 20 || replicas[0].original_group == 50);
        }
    }

    #[test]
    fn half_remainders_round_to_even() {
        let count = |weights: Vec<f64>| {
            let replicas =
                truncate_replicate_sample(&problem(), &fit(weights), &mut seeded_rng(3)).unwrap();
            (
                replicas.len(),
                replicas.iter().filter(|r| r.sampled).count(),
            )
        };
        // 0.5 left over rounds down to 0
        assert_eq!(count(vec![1.5, 1.0, 1.0, 1.0, 1.0, 1.0]), (5, 0));
        // 1.5 rounds up to 2
        assert_eq!(count(vec![1.5, 1.5, 1.5, 1.0, 1.0, 1.0]), (7, 2));
        // 2.5 rounds down to 2
        assert_eq!(count(vec![1.5, 1.5, 1.5, 1.5, 1.5, 1.5]), (7, 2));
    }

    #[test]
    fn same_seed_same_replicas() {
        let weights = fit(vec![0.3, 0.3, 0.3, 0.3, 0.3, 0.3]);
        let a = truncate_replicate_sample(&problem(), &weights, &mut seeded_rng(7)).unwrap();
        let b = truncate_replicate_sample(&problem(), &weights, &mut seeded_rng(7)).unwrap();
        assert_eq!(a, b);
        assert!(truncate_replicate_sample(&problem(), &fit(vec![1.0]), &mut seeded_rng(7)).is_err());
    }
}
