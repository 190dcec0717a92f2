use serde::Deserialize;

use crate::{
    error::{CmapError, Result},
    utils::{round_to, same_cutoff},
};

/// Decimals kept on generated cutoffs
const GRID_DECIMALS: i32 = 10;

/// Largest number of cutoffs an automatic grid may produce
pub const MAX_GRID_CUTOFFS: usize = 10_000;

/// Source of the cutoffs a sweep visits
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CutoffGrid {
    /// Explicit cutoffs, visited in ascending order
    Fixed(Vec<f64>),
    /// Cutoffs from 0 to the smaller tail bound of the effect sizes
    Auto { step: f64 },
}
impl CutoffGrid {
    /// Resolves the grid against the effect sizes a signature is built from
    pub fn resolve(&self, effects: &[f64]) -> Result<Vec<f64>> {
        match self {
            CutoffGrid::Fixed(cutoffs) => {
                if let Some(bad) = cutoffs.iter().find(|c| !c.is_finite() || **c < 0.0) {
                    return Err(CmapError::Config(format!(
                        "cutoff {} must be finite and non-negative",
                        bad
                    )));
                }
                let mut cutoffs = cutoffs.clone();
                cutoffs.sort_unstable_by(f64::total_cmp);
                cutoffs.dedup_by(|a, b| same_cutoff(*a, *b));
                Ok(cutoffs)
            }
            CutoffGrid::Auto { step } => derive_grid(effects, *step),
        }
    }
}

/// Cutoffs from 0 to `min(max positive, |min negative|)` in steps of `step`
///
/// Every cutoff is reachable on both tails. Non-finite effect sizes are
/// ignored; a table lacking either tail yields only the 0 cutoff.
pub fn derive_grid(effects: &[f64], step: f64) -> Result<Vec<f64>> {
    if !step.is_finite() || step <= 0.0 {
        return Err(CmapError::Config(format!(
            "grid step must be positive, got {}",
            step
        )));
    }
    let finite = effects.iter().copied().filter(|x| x.is_finite());
    let max_pos = finite.clone().filter(|&x| x > 0.0).fold(f64::NAN, f64::max);
    let max_neg = finite.filter(|&x| x < 0.0).fold(f64::NAN, f64::min);
    if max_pos.is_nan() || max_neg.is_nan() {
        return Ok(vec![0.0]);
    }

    let bound = max_pos.abs().min(max_neg.abs());
    let n_steps = ((bound / step) + 1e-9).floor();
    if n_steps >= MAX_GRID_CUTOFFS as f64 {
        return Err(CmapError::Config(format!(
            "grid step {} yields more than {} cutoffs up to {}",
            step, MAX_GRID_CUTOFFS, bound
        )));
    }
    let n_steps = n_steps as usize;
    Ok((0..=n_steps)
        .map(|i| round_to(i as f64 * step, GRID_DECIMALS))
        .collect())
}
