//! Maximum summed-dissimilarity selection over a candidate pool.

use ac_types::Condition;

/// Scores closer than this are treated as tied.
const SCORE_EPSILON: f64 = 1e-9;

/// Sum of absolute distances from a candidate to every reference condition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DissimilarityScore {
    pub summed: f64,
}

impl DissimilarityScore {
    pub fn of(candidate: Condition, reference: &[Condition]) -> Self {
        let summed = reference.iter().map(|r| candidate.distance(*r)).sum();
        Self { summed }
    }

    /// Strictly larger sum, beyond the tie epsilon.
    fn beats(&self, other: &Self) -> bool {
        self.summed - other.summed > SCORE_EPSILON
    }
}

/// Pick `n` pool entries maximizing summed distance to `reference`.
///
/// Greedy over a fixed score, which is exact here because a candidate's score
/// does not depend on the other selections. Ties go to the earliest drawn
/// entry. Returned in selection order.
pub fn select_most_dissimilar(
    pool: &[Condition],
    reference: &[Condition],
    n: usize,
) -> Vec<Condition> {
    let scores: Vec<DissimilarityScore> = pool
        .iter()
        .map(|c| DissimilarityScore::of(*c, reference))
        .collect();

    let mut taken = vec![false; pool.len()];
    let mut selected = Vec::with_capacity(n.min(pool.len()));

    for _ in 0..n.min(pool.len()) {
        let mut best: Option<usize> = None;
        for (i, score) in scores.iter().enumerate() {
            if taken[i] {
                continue;
            }
            match best {
                Some(b) if !score.beats(&scores[b]) => {}
                _ => best = Some(i),
            }
        }
        if let Some(i) = best {
            taken[i] = true;
            selected.push(pool[i]);
        }
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conds(values: &[f64]) -> Vec<Condition> {
        values.iter().map(|v| Condition::new(*v).unwrap()).collect()
    }

    #[test]
    fn prefers_midpoint_between_references() {
        let reference = conds(&[0.1, 0.9]);
        let pool = conds(&[0.5, 0.11, 0.89]);
        let picked = select_most_dissimilar(&pool, &reference, 1);
        assert_eq!(picked.len(), 1);
        assert!((picked[0].value() - 0.5).abs() < 1e-12, "picked {:?}", picked);
    }

    #[test]
    fn equal_sums_keep_draw_order() {
        // 0.3 and 0.5 both sum to 0.8 against [0.1, 0.9]
        let reference = conds(&[0.1, 0.9]);
        let pool = conds(&[0.3, 0.5]);
        let scores: Vec<f64> = pool
            .iter()
            .map(|c| DissimilarityScore::of(*c, &reference).summed)
            .collect();
        assert!((scores[0] - scores[1]).abs() < 1e-9);
        assert_eq!(select_most_dissimilar(&pool, &reference, 1), conds(&[0.3]));
        assert_eq!(select_most_dissimilar(&pool, &reference, 2), conds(&[0.3, 0.5]));
    }

    #[test]
    fn larger_summed_distance_wins() {
        let reference = conds(&[0.0]);
        let pool = conds(&[0.2, 0.9, 0.5]);
        let picked = select_most_dissimilar(&pool, &reference, 2);
        assert_eq!(picked, conds(&[0.9, 0.5]));
    }

    #[test]
    fn exact_ties_go_to_first_drawn() {
        let reference = conds(&[0.5]);
        let pool = conds(&[0.2, 0.8, 0.3]);
        let picked = select_most_dissimilar(&pool, &reference, 1);
        assert_eq!(picked, conds(&[0.2]));
    }

    #[test]
    fn never_selects_more_than_pool() {
        let reference = conds(&[0.5]);
        let pool = conds(&[0.1, 0.2]);
        assert_eq!(select_most_dissimilar(&pool, &reference, 5).len(), 2);
        assert!(select_most_dissimilar(&[], &reference, 3).is_empty());
    }
}
