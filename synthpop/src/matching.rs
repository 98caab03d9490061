//! Hierarchical statistical matching: give every target row a source row that agrees on as many
//! of the leading key columns as the source supports, drawn proportionally to source weight.

use std::collections::BTreeMap;
use std::ops::Range;

use anyhow::Result;
use rand::Rng;
use rand_xorshift::XorShiftRng;
use serde::{Deserialize, Serialize};

use synthutil::{fork_rng, prettyprint_usize, Parallelism, Timer};

use crate::filters::{selected, Domains, FilterIndex};
use crate::{Code, Table};

/// What to match on. The key columns are ordered from most to least significant; backing off
/// always drops the last remaining one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchingSpec {
    pub source_id: String,
    pub source_weight: String,
    pub target_id: String,
    pub columns: Vec<String>,
    /// A key combination needs at least this many source rows to be used
    pub minimum_observations: usize,
}

/// Parallel vectors, one entry per target row, in the target's order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub target_ids: Vec<Code>,
    pub source_ids: Vec<Code>,
    /// How many leading key columns the match agreed on. 0 means an unconstrained draw.
    pub levels: Vec<usize>,
}

impl Assignment {
    pub fn len(&self) -> usize {
        self.target_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.target_ids.is_empty()
    }

    /// The number of rows matched at exactly each level `0..=max_level`.
    pub fn histogram(&self, max_level: usize) -> Vec<usize> {
        let mut counts = vec![0; max_level + 1];
        for level in &self.levels {
            counts[*level] += 1;
        }
        counts
    }

    /// The number of rows matched at each level `0..=max_level` or better.
    pub fn cumulative(&self, max_level: usize) -> Vec<usize> {
        let mut counts = self.histogram(max_level);
        for level in (0..max_level).rev() {
            counts[level] += counts[level + 1];
        }
        counts
    }

    fn append(&mut self, other: Assignment) {
        self.target_ids.extend(other.target_ids);
        self.source_ids.extend(other.source_ids);
        self.levels.extend(other.levels);
    }
}

/// Inverse-CDF sampling over a subset of source rows.
struct WeightedRows {
    rows: Vec<usize>,
    cdf: Vec<f64>,
}

impl WeightedRows {
    /// None if the rows have no total weight.
    fn new(rows: Vec<usize>, weights: &[f64]) -> Option<WeightedRows> {
        let mut cdf = Vec::with_capacity(rows.len());
        let mut total = 0.0;
        for r in &rows {
            total += weights[*r];
            cdf.push(total);
        }
        if !(total > 0.0) {
            return None;
        }
        for x in &mut cdf {
            *x /= total;
        }
        Some(WeightedRows { rows, cdf })
    }

    /// `u` in [0, 1). Rows with zero weight never get picked, since they don't move the CDF.
    fn pick(&self, u: f64) -> usize {
        let idx = self.cdf.partition_point(|x| *x <= u);
        self.rows[idx.min(self.rows.len() - 1)]
    }
}

pub fn statistical_matching(
    source: &Table,
    target: &Table,
    spec: &MatchingSpec,
    rng: &mut XorShiftRng,
) -> Result<Assignment> {
    let source_ids = source.codes(&spec.source_id)?;
    let weights = source.reals(&spec.source_weight)?;
    let target_ids = target.codes(&spec.target_id)?;
    if let Some(w) = weights.iter().find(|w| !(**w >= 0.0)) {
        bail!("source weight {} has invalid value {}", spec.source_weight, w);
    }

    let domains = Domains::union(&spec.columns, &[source, target])?;
    let source_index = FilterIndex::build(source, &domains)?;
    let target_keys = domains.encode(target)?;

    // One draw per target row, reused at whichever level resolves it
    let uniform: Vec<f64> = (0..target.len()).map(|_| rng.gen::<f64>()).collect();
    let mut assigned: Vec<Option<(usize, usize)>> = vec![None; target.len()];

    for level in (1..=spec.columns.len()).rev() {
        // Only combinations that still have unmatched targets matter
        let mut pending: BTreeMap<&[usize], Vec<usize>> = BTreeMap::new();
        for (row, keys) in target_keys.iter().enumerate() {
            if assigned[row].is_none() {
                pending
                    .entry(&keys[..level])
                    .or_insert_with(Vec::new)
                    .push(row);
            }
        }
        if pending.is_empty() {
            break;
        }

        let mut matched = 0;
        for (combination, rows) in pending {
            let support = selected(&source_index.mask(combination));
            if support.is_empty() || support.len() < spec.minimum_observations {
                continue;
            }
            let sampler = match WeightedRows::new(support, weights) {
                Some(x) => x,
                None => continue,
            };
            for row in rows {
                assigned[row] = Some((sampler.pick(uniform[row]), level));
                matched += 1;
            }
        }
        debug!(
            "Matched {} on the first {} of {:?}",
            prettyprint_usize(matched),
            level,
            spec.columns
        );
    }

    let unmatched: Vec<usize> = (0..target.len())
        .filter(|row| assigned[*row].is_none())
        .collect();
    if !unmatched.is_empty() {
        let sampler = WeightedRows::new((0..source.len()).collect(), weights).ok_or_else(|| {
            anyhow!(
                "{} targets need an unconstrained match, but the source has no weight",
                unmatched.len()
            )
        })?;
        for row in unmatched {
            assigned[row] = Some((sampler.pick(uniform[row]), 0));
        }
    }

    let mut result = Assignment {
        target_ids: target_ids.to_vec(),
        source_ids: Vec::with_capacity(target.len()),
        levels: Vec::with_capacity(target.len()),
    };
    for entry in assigned {
        let (source_row, level) = entry.ok_or_else(|| anyhow!("a target row wasn't matched"))?;
        result.source_ids.push(source_ids[source_row]);
        result.levels.push(level);
    }
    Ok(result)
}

/// Split the target into contiguous chunks of `chunk_size` rows, each with its own RNG forked
/// from `rng` in chunk order, and match the chunks in parallel. The number of workers doesn't
/// change the result.
pub fn parallel_statistical_matching(
    source: &Table,
    target: &Table,
    spec: &MatchingSpec,
    chunk_size: usize,
    rng: &mut XorShiftRng,
    parallelism: Parallelism,
    timer: &mut Timer,
) -> Result<Assignment> {
    let requests: Vec<(Table, XorShiftRng)> = split_into_chunks(target.len(), chunk_size)
        .into_iter()
        .map(|range| (target.take(&range.collect::<Vec<_>>()), fork_rng(rng)))
        .collect();

    let mut result = Assignment::default();
    for chunk in timer.parallelize(
        "statistical matching",
        parallelism,
        requests,
        |(chunk, mut rng): (Table, XorShiftRng)| statistical_matching(source, &chunk, spec, &mut rng),
    ) {
        result.append(chunk?);
    }
    Ok(result)
}

/// Contiguous ranges of `chunk_size` items, except for a shorter last one.
fn split_into_chunks(n: usize, chunk_size: usize) -> Vec<Range<usize>> {
    let chunk_size = chunk_size.max(1);
    (0..n)
        .step_by(chunk_size)
        .map(|start| start..(start + chunk_size).min(n))
        .collect()
}

#[cfg(test)]
mod tests {
    use synthutil::seeded_rng;

    use super::*;

    fn spec(minimum_observations: usize) -> MatchingSpec {
        MatchingSpec {
            source_id: "source_id".to_string(),
            source_weight: "weight".to_string(),
            target_id: "target_id".to_string(),
            columns: vec!["sex".to_string(), "age_class".to_string()],
            minimum_observations,
        }
    }

    // 100 rows with weight 1. Only 3 of them have sex=1, age_class=2.
    fn source() -> Table {
        let mut sex = Vec::new();
        let mut age_class = Vec::new();
        let counts = [((0, 0), 20), ((0, 1), 20), ((0, 2), 20), ((1, 0), 20), ((1, 1), 17), ((1, 2), 3)];
        for ((s, a), n) in counts {
            for _ in 0..n {
                sex.push(s);
                age_class.push(a);
            }
        }
        Table::new(100)
            .with_codes("source_id", (1000..1100).collect())
            .unwrap()
            .with_codes("sex", sex)
            .unwrap()
            .with_codes("age_class", age_class)
            .unwrap()
            .with_reals("weight", vec![1.0; 100])
            .unwrap()
    }

    fn target() -> Table {
        Table::new(10)
            .with_codes("target_id", (1..=10).collect())
            .unwrap()
            .with_codes("sex", vec![0, 0, 0, 1, 1, 1, 1, 1, 0, 1])
            .unwrap()
            .with_codes("age_class", vec![0, 1, 2, 0, 1, 2, 2, 2, 1, 0])
            .unwrap()
    }

    fn source_row(source: &Table, id: Code) -> usize {
        source
            .codes("source_id")
            .unwrap()
            .iter()
            .position(|x| *x == id)
            .unwrap()
    }

    #[test]
    fn sparse_combinations_back_off() {
        let source = source();
        let target = target();
        let assignment =
            statistical_matching(&source, &target, &spec(5), &mut seeded_rng(42)).unwrap();
        assert_eq!(assignment.len(), 10);
        assert_eq!(assignment.target_ids, (1..=10).collect::<Vec<_>>());

        let target_sex = target.codes("sex").unwrap();
        let target_age = target.codes("age_class").unwrap();
        for row in 0..10 {
            let level = assignment.levels[row];
            let matched = source_row(&source, assignment.source_ids[row]);
            if target_sex[row] == 1 && target_age[row] == 2 {
                // Level 1 always has support here
                assert_eq!(level, 1);
                assert_eq!(source.codes("sex").unwrap()[matched], 1);
            } else {
                assert_eq!(level, 2);
                assert_eq!(source.codes("sex").unwrap()[matched], target_sex[row]);
                assert_eq!(source.codes("age_class").unwrap()[matched], target_age[row]);
            }
        }
        assert_eq!(assignment.histogram(2), vec![0, 3, 7]);
        assert_eq!(assignment.cumulative(2), vec![10, 10, 7]);
    }

    #[test]
    fn no_support_anywhere_falls_back_to_everything() {
        let target = Table::new(2)
            .with_codes("target_id", vec![1, 2])
            .unwrap()
            .with_codes("sex", vec![7, 7])
            .unwrap()
            .with_codes("age_class", vec![0, 9])
            .unwrap();
        let assignment =
            statistical_matching(&source(), &target, &spec(5), &mut seeded_rng(1)).unwrap();
        assert_eq!(assignment.levels, vec![0, 0]);
        assert!(assignment.source_ids.iter().all(|id| *id >= 1000 && *id < 1100));
    }

    #[test]
    fn minimum_observations_is_inclusive() {
        // Exactly 3 source rows for (1, 2)
        let assignment =
            statistical_matching(&source(), &target(), &spec(3), &mut seeded_rng(42)).unwrap();
        assert!(assignment.levels.iter().all(|l| *l == 2));
    }

    #[test]
    fn zero_weight_rows_are_never_chosen() {
        let mut source = source();
        let weights: Vec<f64> = (0..100).map(|i| if i % 2 == 0 { 0.0 } else { 1.0 }).collect();
        source.set_reals("weight", weights).unwrap();
        for seed in 0..10 {
            let assignment =
                statistical_matching(&source, &target(), &spec(0), &mut seeded_rng(seed))
                    .unwrap();
            for id in &assignment.source_ids {
                assert_eq!(source_row(&source, *id) % 2, 1);
            }
        }
    }

    #[test]
    fn zero_weight_combinations_back_off() {
        let mut source = source();
        // Remove all weight from (0, 0)
        let weights: Vec<f64> = (0..100).map(|i| if i < 20 { 0.0 } else { 1.0 }).collect();
        source.set_reals("weight", weights).unwrap();
        let assignment =
            statistical_matching(&source, &target(), &spec(1), &mut seeded_rng(3)).unwrap();
        assert_eq!(assignment.levels[0], 1);
        assert!(source_row(&source, assignment.source_ids[0]) >= 20);
    }

    #[test]
    fn same_seed_same_assignment() {
        let a = statistical_matching(&source(), &target(), &spec(5), &mut seeded_rng(9)).unwrap();
        let b = statistical_matching(&source(), &target(), &spec(5), &mut seeded_rng(9)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_inputs() {
        let empty_target = target().take(&[]);
        let assignment =
            statistical_matching(&source(), &empty_target, &spec(5), &mut seeded_rng(0)).unwrap();
        assert!(assignment.is_empty());

        let empty_source = source().take(&[]);
        assert!(statistical_matching(&empty_source, &target(), &spec(5), &mut seeded_rng(0)).is_err());

        let mut weightless = source();
        weightless.set_reals("weight", vec![0.0; 100]).unwrap();
        assert!(statistical_matching(&weightless, &target(), &spec(5), &mut seeded_rng(0)).is_err());
    }

    #[test]
    fn no_key_columns_is_unconstrained() {
        let mut spec = spec(5);
        spec.columns.clear();
        let assignment =
            statistical_matching(&source(), &target(), &spec, &mut seeded_rng(0)).unwrap();
        assert_eq!(assignment.histogram(0), vec![10]);
    }

    #[test]
    fn picks_follow_the_cdf() {
        let weights = vec![0.0, 1.0, 0.0, 3.0];
        let sampler = WeightedRows::new(vec![0, 1, 2, 3], &weights).unwrap();
        assert_eq!(sampler.pick(0.0), 1);
        assert_eq!(sampler.pick(0.2499), 1);
        assert_eq!(sampler.pick(0.25), 3);
        assert_eq!(sampler.pick(0.9999), 3);
        assert!(WeightedRows::new(vec![0, 2], &weights).is_none());
        assert!(WeightedRows::new(Vec::new(), &weights).is_none());
    }

    #[test]
    fn chunks() {
        assert_eq!(split_into_chunks(10, 4), vec![0..4, 4..8, 8..10]);
        assert_eq!(split_into_chunks(2, 4), vec![0..2]);
        assert_eq!(split_into_chunks(5, 0), vec![0..1, 1..2, 2..3, 3..4, 4..5]);
        assert!(split_into_chunks(0, 4).is_empty());
    }

    fn parallel(chunk_size: usize, threads: usize) -> Assignment {
        parallel_statistical_matching(
            &source(),
            &target(),
            &spec(5),
            chunk_size,
            &mut seeded_rng(5),
            Parallelism::Threads(threads),
            &mut Timer::throwaway(),
        )
        .unwrap()
    }

    #[test]
    fn parallel_matches_chunks_independently() {
        // One chunk is just a forked stream
        let direct = statistical_matching(
            &source(),
            &target(),
            &spec(5),
            &mut fork_rng(&mut seeded_rng(5)),
        )
        .unwrap();
        assert_eq!(parallel(10, 1), direct);
        assert_eq!(parallel(100, 4), direct);

        let a = parallel(3, 2);
        assert_eq!(a, parallel(3, 2));
        assert_eq!(a.target_ids, (1..=10).collect::<Vec<_>>());
        assert_eq!(a.histogram(2), vec![0, 3, 7]);
    }

    #[test]
    fn worker_count_does_not_change_the_assignment() {
        let single = parallel(3, 1);
        for threads in [2, 4, 8] {
            assert_eq!(parallel(3, threads), single);
        }
    }

    #[test]
    fn one_draw_per_row_at_any_level() {
        let source = source();
        let weights = vec![1.0; 100];
        let mut rng = seeded_rng(42);
        let uniform: Vec<f64> = (0..10).map(|_| rng.gen::<f64>()).collect();

        // Source rows 0..20 are (0, 0), 60..100 have sex 1
        let pick = |rows: Range<usize>, row: usize| {
            let sampler = WeightedRows::new(rows.collect(), &weights).unwrap();
            source.codes("source_id").unwrap()[sampler.pick(uniform[row])]
        };

        let a = statistical_matching(&source, &target(), &spec(5), &mut seeded_rng(42)).unwrap();
        // Row 0 is (0, 0), rows 5 to 7 are (1, 2) and back off to sex alone
        assert_eq!(a.levels[0], 2);
        assert_eq!(a.source_ids[0], pick(0..20, 0));
        for row in 5..8 {
            assert_eq!(a.levels[row], 1);
            assert_eq!(a.source_ids[row], pick(60..100, row));
        }

        // Only 17 rows are (1, 1), so row 4 backs off too. Nobody else's draw moves.
        let b = statistical_matching(&source, &target(), &spec(18), &mut seeded_rng(42)).unwrap();
        assert_eq!(b.levels[4], 1);
        assert_eq!(b.source_ids[4], pick(60..100, 4));
        assert_eq!(b.source_ids[0], a.source_ids[0]);
        for row in 5..8 {
            assert_eq!(b.source_ids[row], a.source_ids[row]);
        }
    }
}
