use adjustp::{adjust, Procedure};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::math::argsort;

/// Tuning grid for the proportion of true nulls
const LAMBDAS: [f64; 19] = [
    0.05, 0.10, 0.15, 0.20, 0.25, 0.30, 0.35, 0.40, 0.45, 0.50, 0.55, 0.60, 0.65, 0.70, 0.75,
    0.80, 0.85, 0.90, 0.95,
];

/// Preferred q-value estimator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FdrMethod {
    /// Storey q-values with bootstrap `pi0`, falling back to BH
    #[default]
    Storey,
    /// Benjamini-Hochberg step-up only
    BenjaminiHochberg,
}

/// The estimator that actually produced a set of q-values
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FdrPath {
    Storey { pi0: f64 },
    BenjaminiHochberg,
    /// Storey failed and BH was substituted
    BenjaminiHochbergFallback,
}

/// Why the adaptive estimator could not be used
#[derive(Debug, Clone, PartialEq)]
pub enum Pi0Failure {
    Empty,
    PvalueRange { max_p: f64 },
    NonPositive(f64),
}
impl std::fmt::Display for Pi0Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pi0Failure::Empty => write!(f, "no p-values"),
            Pi0Failure::PvalueRange { max_p } => {
                write!(f, "maximum p-value {} is below the lambda range", max_p)
            }
            Pi0Failure::NonPositive(pi0) => write!(f, "estimated pi0 {} is not positive", pi0),
        }
    }
}

/// Type-7 quantile of an unsorted slice
fn quantile(x: &[f64], prob: f64) -> f64 {
    let mut sorted = x.to_vec();
    sorted.sort_unstable_by(f64::total_cmp);
    let h = (sorted.len() - 1) as f64 * prob;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

/// Estimates the proportion of true null hypotheses
///
/// Picks the lambda minimizing the bootstrap mean squared error of the
/// Storey estimator.
pub fn estimate_pi0(pvalues: &[f64]) -> Result<f64, Pi0Failure> {
    if pvalues.is_empty() {
        return Err(Pi0Failure::Empty);
    }
    let m = pvalues.len() as f64;
    let max_p = pvalues.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max_p < LAMBDAS[LAMBDAS.len() - 1] {
        return Err(Pi0Failure::PvalueRange { max_p });
    }

    let counts = LAMBDAS
        .iter()
        .map(|&l| pvalues.iter().filter(|&&p| p >= l).count() as f64)
        .collect::<Vec<_>>();
    let pi0s = LAMBDAS
        .iter()
        .zip(counts.iter())
        .map(|(l, w)| w / (m * (1.0 - l)))
        .collect::<Vec<_>>();
    let min_pi0 = quantile(&pi0s, 0.1);

    let mut best = (f64::INFINITY, pi0s[0]);
    for ((l, w), pi0) in LAMBDAS.iter().zip(counts.iter()).zip(pi0s.iter()) {
        let mse = (w / (m * m * (1.0 - l).powi(2))) * (1.0 - w / m) + (pi0 - min_pi0).powi(2);
        if mse < best.0 {
            best = (mse, *pi0);
        }
    }
    let pi0 = best.1.min(1.0);
    if !pi0.is_finite() || pi0 <= 0.0 {
        return Err(Pi0Failure::NonPositive(pi0));
    }
    Ok(pi0)
}

/// Storey q-values for a given `pi0`
pub fn storey_qvalues(pvalues: &[f64], pi0: f64) -> Vec<f64> {
    let m = pvalues.len();
    let order = argsort(pvalues);
    let mut qvalues = vec![0.0; m];
    let mut running = 1.0f64;
    for (position, &i) in order.iter().enumerate().rev() {
        let q = pvalues[i] * m as f64 / (position + 1) as f64;
        running = running.min(q);
        qvalues[i] = pi0 * running.min(1.0);
    }
    qvalues
}

/// Computes q-values, recording which estimator produced them
pub fn qvalues(pvalues: &[f64], method: FdrMethod) -> (Vec<f64>, FdrPath) {
    if pvalues.is_empty() {
        return (Vec::new(), FdrPath::BenjaminiHochberg);
    }
    match method {
        FdrMethod::BenjaminiHochberg => (
            adjust(pvalues, Procedure::BenjaminiHochberg),
            FdrPath::BenjaminiHochberg,
        ),
        FdrMethod::Storey => match estimate_pi0(pvalues) {
            Ok(pi0) => (storey_qvalues(pvalues, pi0), FdrPath::Storey { pi0 }),
            Err(failure) => {
                warn!(%failure, "storey q-value estimation failed, using Benjamini-Hochberg");
                (
                    adjust(pvalues, Procedure::BenjaminiHochberg),
                    FdrPath::BenjaminiHochbergFallback,
                )
            }
        },
    }
}
