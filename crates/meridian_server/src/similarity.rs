//! Similarity score adjustment, exposed to scripts as
//! `tile38.adjusted_similarity_scores(algorithm_params, scores, distances,
//! ages)`.
//!
//! Raw similarity scores in `[0, 100]` are discounted by how unusual each
//! match's distance and age are within the candidate set: the normal-CDF
//! mass between the set minimum and the match's value, scaled by a maximum
//! penalty per dimension. Algorithms dispatch on a name so scorers can be
//! added without touching callers; `classic` is the one implemented.

use meridian_common::error::ScriptError;

use crate::stats_array::{cdf_with_floor, StatsArray};

/// Default penalty scales for the `classic` algorithm, matching the tuned
/// production behavior: distance outliers cost up to 3.5 points, stale
/// matches up to 20.
pub const DEFAULT_DIST_MAX_PENALTY: f64 = 3.5;
pub const DEFAULT_AGE_MAX_PENALTY: f64 = 20.0;

/// Parsed `algorithm_params` table: the algorithm name plus the per-call
/// penalty overrides.
#[derive(Debug, Clone)]
pub struct SimilarityParams {
    pub algorithm: String,
    pub dist_max_penalty: f64,
    pub age_max_penalty: f64,
}

impl Default for SimilarityParams {
    fn default() -> Self {
        Self {
            algorithm: "classic".into(),
            dist_max_penalty: DEFAULT_DIST_MAX_PENALTY,
            age_max_penalty: DEFAULT_AGE_MAX_PENALTY,
        }
    }
}

/// Adjust `scores` by the distance and age penalties of the selected
/// algorithm. The three sequences are positionally paired and must be the
/// same length.
pub fn adjusted_similarity_scores(
    params: &SimilarityParams,
    scores: &[f64],
    distances: &[f64],
    ages: &[f64],
) -> Result<Vec<f64>, ScriptError> {
    if scores.len() != distances.len() || scores.len() != ages.len() {
        return Err(ScriptError::Runtime(
            "scores, distances and ages must have the same length".into(),
        ));
    }
    match params.algorithm.as_str() {
        "classic" => Ok(adjusted_scores_classic(params, scores, distances, ages)),
        other => Err(ScriptError::Runtime(format!(
            "similarity '{}' algorithm not implemented",
            other
        ))),
    }
}

/// The `classic` scorer: each score loses the CDF mass of its distance and
/// age (floored at the set minimum) times the dimension's max penalty, then
/// clamps to `[0, 100]`.
fn adjusted_scores_classic(
    params: &SimilarityParams,
    scores: &[f64],
    distances: &[f64],
    ages: &[f64],
) -> Vec<f64> {
    let (mean_dist, std_dist, min_dist) = mean_std_min(distances);
    let (mean_age, std_age, min_age) = mean_std_min(ages);

    scores
        .iter()
        .zip(distances.iter().zip(ages.iter()))
        .map(|(&score, (&dist, &age))| {
            let dist_penalty =
                cdf_with_floor(dist, min_dist, mean_dist, std_dist) * params.dist_max_penalty;
            let age_penalty =
                cdf_with_floor(age, min_age, mean_age, std_age) * params.age_max_penalty;
            (score - dist_penalty - age_penalty).clamp(0.0, 100.0)
        })
        .collect()
}

fn mean_std_min(data: &[f64]) -> (f64, f64, f64) {
    let mut stats = StatsArray::new();
    for &value in data {
        stats.append(value);
    }
    (stats.mean(), stats.stddev(), stats.min())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCORES: [f64; 3] = [99.0, 88.0, 77.0];
    const DISTANCES: [f64; 3] = [100.0, 50.0, 200.0];
    const AGES: [f64; 3] = [100.0, 200.0, 300.0];

    fn floors(values: &[f64]) -> Vec<i64> {
        values.iter().map(|v| v.floor() as i64).collect()
    }

    #[test]
    fn test_classic_with_default_penalties() {
        let params = SimilarityParams::default();
        let adjusted =
            adjusted_similarity_scores(&params, &SCORES, &DISTANCES, &AGES).unwrap();
        assert_eq!(floors(&adjusted), vec![98, 80, 58]);
    }

    #[test]
    fn test_classic_with_explicit_penalties() {
        let params = SimilarityParams {
            algorithm: "classic".into(),
            dist_max_penalty: 10.0,
            age_max_penalty: 20.0,
        };
        let adjusted =
            adjusted_similarity_scores(&params, &SCORES, &DISTANCES, &AGES).unwrap();
        assert_eq!(floors(&adjusted), vec![96, 80, 53]);
    }

    #[test]
    fn test_minimum_distance_and_age_cost_nothing() {
        // The second entry sits at the distance minimum; its only penalty
        // comes from age.
        let params = SimilarityParams {
            algorithm: "classic".into(),
            dist_max_penalty: 10.0,
            age_max_penalty: 0.0,
        };
        let adjusted =
            adjusted_similarity_scores(&params, &SCORES, &DISTANCES, &AGES).unwrap();
        assert_eq!(adjusted[1], 88.0);
    }

    #[test]
    fn test_adjusted_scores_clamped() {
        let params = SimilarityParams {
            algorithm: "classic".into(),
            dist_max_penalty: 1000.0,
            age_max_penalty: 1000.0,
        };
        // The first entry sits at both minimums (no penalty) and clamps at
        // the ceiling; the second is driven far below zero and clamps there.
        let adjusted =
            adjusted_similarity_scores(&params, &[150.0, 5.0], &[1.0, 2.0], &[1.0, 2.0])
                .unwrap();
        assert_eq!(adjusted[0], 100.0);
        assert_eq!(adjusted[1], 0.0);
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        let params = SimilarityParams {
            algorithm: "quantum".into(),
            ..Default::default()
        };
        let err = adjusted_similarity_scores(&params, &SCORES, &DISTANCES, &AGES).unwrap_err();
        assert_eq!(
            err.to_string(),
            "similarity 'quantum' algorithm not implemented"
        );
    }

    #[test]
    fn test_mismatched_lengths_rejected() {
        let params = SimilarityParams::default();
        assert!(adjusted_similarity_scores(&params, &SCORES, &DISTANCES[..2], &AGES).is_err());
    }

    #[test]
    fn test_empty_input_yields_empty_output() {
        let params = SimilarityParams::default();
        let adjusted = adjusted_similarity_scores(&params, &[], &[], &[]).unwrap();
        assert!(adjusted.is_empty());
    }
}
