use rayon::prelude::*;
use serde::Deserialize;

use crate::{
    library::{ProfileLibrary, RankedProfile},
    signature::GeneSignature,
};

/// How reported connectivity scores are expressed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreMode {
    /// Signed score as computed
    #[default]
    Raw,
    /// Scaled by the most negative score of the batch into [-1, 0]
    Rescaled,
}

/// Directional Kolmogorov-Smirnov statistic of a sorted rank list
///
/// `ranks` are 1-based positions within a profile of `n` genes, sorted
/// ascending. Lists with fewer than two entries score 0.
pub fn ks_statistic(ranks: &[u32], n: usize) -> f64 {
    let k = ranks.len();
    if k <= 1 {
        return 0.0;
    }
    let k = k as f64;
    let n = n as f64;
    let mut a = f64::NEG_INFINITY;
    let mut b = f64::NEG_INFINITY;
    for (j, &rank) in ranks.iter().enumerate() {
        let position = rank as f64 / n;
        a = a.max((j + 1) as f64 / k - position);
        b = b.max(position - j as f64 / k);
    }
    if a > b {
        a
    } else {
        -b
    }
}

/// Combines the up and down statistics into one connectivity score
///
/// Up and down statistics of the same sign do not support a directional
/// call and score 0.
pub fn combine(ks_up: f64, ks_down: f64) -> f64 {
    if ks_up == 0.0 && ks_down != 0.0 {
        -ks_down
    } else if ks_down == 0.0 && ks_up != 0.0 {
        ks_up
    } else if ks_up.signum() != ks_down.signum() {
        ks_up - ks_down
    } else {
        0.0
    }
}

fn sorted_ranks(genes: &[usize], profile: &RankedProfile) -> Vec<u32> {
    let mut ranks = genes.iter().map(|&g| profile.rank(g)).collect::<Vec<_>>();
    ranks.sort_unstable();
    ranks
}

/// Connectivity score of a signature against one profile
///
/// Negative scores indicate reversal, positive scores mimicry.
pub fn score(up: &[usize], down: &[usize], profile: &RankedProfile) -> f64 {
    let n = profile.len();
    let ks_up = ks_statistic(&sorted_ranks(up, profile), n);
    let ks_down = ks_statistic(&sorted_ranks(down, profile), n);
    combine(ks_up, ks_down)
}

/// Scores a signature against every profile, in library order
pub fn score_all(signature: &GeneSignature, library: &ProfileLibrary) -> Vec<f64> {
    library
        .profiles()
        .par_iter()
        .map(|profile| score(&signature.up, &signature.down, profile))
        .collect()
}

/// Scales a score by the most negative score of its batch into [-1, 0]
pub fn rescale(score: f64, most_negative: f64) -> f64 {
    let denominator = -most_negative;
    if !denominator.is_finite() || denominator <= 0.0 {
        return 0.0;
    }
    (score / denominator).clamp(-1.0, 0.0)
}

/// Applies `mode` to a batch of scores
pub fn apply_mode(scores: &[f64], mode: ScoreMode) -> Vec<f64> {
    match mode {
        ScoreMode::Raw => scores.to_vec(),
        ScoreMode::Rescaled => {
            let most_negative = scores.iter().copied().fold(f64::INFINITY, f64::min);
            scores.iter().map(|s| rescale(*s, most_negative)).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::tests::toy_library;
    use approx::assert_relative_eq;

    #[test]
    fn test_ks_single_rank_is_zero() {
        assert_eq!(ks_statistic(&[], 10), 0.0);
        assert_eq!(ks_statistic(&[3], 10), 0.0);
    }

    #[test]
    fn test_ks_top_ranks_positive() {
        // a = max(0.5 - 0.2, 1.0 - 0.4) = 0.6, b = max(0.2, -0.1) = 0.2
        assert_relative_eq!(ks_statistic(&[1, 2], 5), 0.6);
    }

    #[test]
    fn test_ks_bottom_ranks_negative() {
        // a = max(-0.3, 0.0) = 0.0, b = max(0.8, 0.5) = 0.8
        assert_relative_eq!(ks_statistic(&[4, 5], 5), -0.8);
    }

    #[test]
    fn test_combine_rules() {
        assert_eq!(combine(0.0, 0.4), -0.4);
        assert_eq!(combine(0.3, 0.0), 0.3);
        assert_relative_eq!(combine(0.3, -0.4), 0.7);
        assert_eq!(combine(0.3, 0.4), 0.0);
        assert_eq!(combine(-0.3, -0.4), 0.0);
        assert_eq!(combine(0.0, 0.0), 0.0);
    }

    #[test]
    fn test_mimicry_scores_positive() {
        let lib = toy_library();
        let profile = &lib.profiles()[0];
        let s = score(&[0, 1], &[3, 4], profile);
        assert!(s > 0.0);
        assert_relative_eq!(s, 1.4);
    }

    #[test]
    fn test_reversal_scores_negative() {
        let lib = toy_library();
        let profile = &lib.profiles()[1];
        let s = score(&[0, 1], &[3, 4], profile);
        assert!(s < 0.0);
        assert_relative_eq!(s, -1.4);
    }

    #[test]
    fn test_single_direction_signature() {
        let lib = toy_library();
        let s = score(&[], &[3, 4], &lib.profiles()[1]);
        // down genes at the top of the profile: ks_down = 0.6, score = -0.6
        assert_relative_eq!(s, -0.6);
    }

    #[test]
    fn test_score_all_preserves_order() {
        let lib = toy_library();
        let sig = GeneSignature::new(0.0, vec![0, 1], vec![3, 4]);
        let scores = score_all(&sig, &lib);
        assert_eq!(scores.len(), 2);
        assert!(scores[0] > 0.0 && scores[1] < 0.0);
    }

    #[test]
    fn test_rescale() {
        assert_relative_eq!(rescale(-0.5, -1.0), -0.5);
        assert_eq!(rescale(0.4, -1.0), 0.0);
        assert_eq!(rescale(-0.5, 0.2), 0.0);
        assert_eq!(rescale(-0.5, f64::NEG_INFINITY), 0.0);
        assert_eq!(apply_mode(&[-0.4, -0.8], ScoreMode::Rescaled), vec![-0.5, -1.0]);
    }
}
