use derive_new::new;

use crate::{
    error::{CmapError, Result},
    null::NullDistribution,
    qvalue::{qvalues, FdrMethod, FdrPath},
};

/// Empirical significance of one observed score
#[derive(Debug, Clone, Copy, PartialEq, new)]
pub struct Significance {
    pub p: f64,
    pub q: f64,
}

/// Significance of a batch of scores against one null distribution
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub values: Vec<Significance>,
    pub fdr_path: FdrPath,
}

/// Two-sided empirical p-values against the absolute null scores
///
/// A p-value of exactly 0 is floored to `1 / (n + 1)`.
pub fn empirical_pvalues(null: &NullDistribution, observed: &[f64]) -> Result<Vec<f64>> {
    if null.is_empty() {
        return Err(CmapError::DegenerateNull("null distribution is empty".into()));
    }
    let n = null.len();
    let mut magnitudes = null.scores.iter().map(|s| s.abs()).collect::<Vec<_>>();
    magnitudes.sort_unstable_by(f64::total_cmp);

    let floor = 1.0 / (n + 1) as f64;
    let pvalues = observed
        .iter()
        .map(|score| {
            let target = score.abs();
            if !target.is_finite() {
                return 1.0;
            }
            let at_least = n - magnitudes.partition_point(|&m| m < target);
            let p = at_least as f64 / n as f64;
            if p == 0.0 {
                floor
            } else if !p.is_finite() {
                1.0
            } else {
                p.clamp(0.0, 1.0)
            }
        })
        .collect();
    Ok(pvalues)
}

/// Converts observed scores into p- and q-values
///
/// Fails with `DegenerateNull` when every q-value is exactly zero.
pub fn evaluate(
    null: &NullDistribution,
    observed: &[f64],
    method: FdrMethod,
) -> Result<Evaluation> {
    let pvalues = empirical_pvalues(null, observed)?;
    let (qvalues, fdr_path) = qvalues(&pvalues, method);
    if !qvalues.is_empty() && qvalues.iter().all(|&q| q == 0.0) {
        return Err(CmapError::DegenerateNull(format!(
            "all {} q-values are zero",
            qvalues.len()
        )));
    }
    let values = pvalues
        .into_iter()
        .zip(qvalues)
        .map(|(p, q)| Significance::new(p, q))
        .collect();
    Ok(Evaluation { values, fdr_path })
}
