use bon::Builder;
use serde::Deserialize;

use crate::{
    comparator::ScoreMode,
    error::{CmapError, Result},
    grid::CutoffGrid,
    math::{arithmetic_mean, median, weighted_mean},
    qvalue::FdrMethod,
    signature::SignatureStrategy,
    utils::same_cutoff,
};

/// Support rule deciding which drugs count as robust
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobustRule {
    /// Hit in every scored cutoff
    All,
    /// Hit in at least `k` scored cutoffs
    #[default]
    KOfN,
}
impl RobustRule {
    /// Minimum support a drug needs out of `n_scored` cutoffs
    ///
    /// `k` defaults to 70% of the scored cutoffs, rounded up.
    pub fn required_support(&self, k: Option<usize>, n_scored: usize) -> usize {
        match self {
            RobustRule::All => n_scored,
            RobustRule::KOfN => k.unwrap_or_else(|| (0.7 * n_scored as f64).ceil() as usize),
        }
    }
}

/// Per-cutoff weights; cutoffs without an entry weigh 1
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CutoffWeights(pub Vec<(f64, f64)>);
impl CutoffWeights {
    pub fn weight(&self, cutoff: f64) -> f64 {
        self.0
            .iter()
            .find(|(c, _)| same_cutoff(*c, cutoff))
            .map_or(1.0, |(_, w)| *w)
    }

    pub fn build_weights(&self, cutoffs: &[f64]) -> Vec<f64> {
        cutoffs.iter().map(|c| self.weight(*c)).collect()
    }

    /// Weights must be finite and positive so every weighted mean is defined
    pub fn validate(&self) -> Result<()> {
        for (cutoff, weight) in &self.0 {
            if !cutoff.is_finite() {
                return Err(CmapError::Config(format!(
                    "weight keyed by non-finite cutoff {}",
                    cutoff
                )));
            }
            if !(weight.is_finite() && *weight > 0.0) {
                return Err(CmapError::Config(format!(
                    "weight {} for cutoff {} must be finite and positive",
                    weight, cutoff
                )));
            }
        }
        Ok(())
    }
}

/// How a drug's scores across supporting cutoffs are combined
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFn {
    #[default]
    Mean,
    Median,
    WeightedMean(CutoffWeights),
}
impl AggregateFn {
    /// Aggregates `scores`, where `scores[i]` was observed at `cutoffs[i]`
    pub fn aggregate(&self, scores: &[f64], cutoffs: &[f64]) -> f64 {
        match self {
            AggregateFn::Mean => arithmetic_mean(scores),
            AggregateFn::Median => median(scores).unwrap_or(f64::NAN),
            AggregateFn::WeightedMean(weights) => {
                weighted_mean(scores, &weights.build_weights(cutoffs))
            }
        }
    }
}

/// Scalar configuration of a scoring run or sweep
#[derive(Debug, Clone, Builder)]
pub struct SweepConfig {
    /// How effect columns become one value per gene
    pub strategy: SignatureStrategy,
    /// Cutoffs to visit; ignored by single-cutoff runs
    #[builder(default = CutoffGrid::Auto { step: 0.1 })]
    pub grid: CutoffGrid,
    /// Genes must have a p-value strictly below this to enter a signature
    pub p_value_cutoff: Option<f64>,
    #[builder(default = 0.05)]
    pub q_value_threshold: f64,
    #[builder(default = 100_000)]
    pub n_permutations: usize,
    #[builder(default = 42)]
    pub seed: u64,
    #[builder(default = 10)]
    pub min_genes: usize,
    /// Minimum signature size as a fraction of the genes before filtering
    #[builder(default = 0.0)]
    pub min_fraction: f64,
    /// Abort the remaining sweep at the first undersized cutoff
    #[builder(default = false)]
    pub stop_on_small: bool,
    #[builder(default)]
    pub fdr_method: FdrMethod,
    #[builder(default)]
    pub score_mode: ScoreMode,
    #[builder(default)]
    pub robust_rule: RobustRule,
    pub robust_k: Option<usize>,
    #[builder(default)]
    pub aggregate_fn: AggregateFn,
    /// Worker threads; defaults to one fewer than the available cores
    pub workers: Option<usize>,
}
impl SweepConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_permutations == 0 {
            return Err(CmapError::Config("n_permutations must be positive".into()));
        }
        if !(self.q_value_threshold > 0.0 && self.q_value_threshold <= 1.0) {
            return Err(CmapError::Config(format!(
                "q_value_threshold {} must lie in (0, 1]",
                self.q_value_threshold
            )));
        }
        if let Some(p) = self.p_value_cutoff {
            if !(p > 0.0 && p <= 1.0) {
                return Err(CmapError::Config(format!(
                    "p_value_cutoff {} must lie in (0, 1]",
                    p
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.min_fraction) {
            return Err(CmapError::Config(format!(
                "min_fraction {} must lie in [0, 1]",
                self.min_fraction
            )));
        }
        if let AggregateFn::WeightedMean(weights) = &self.aggregate_fn {
            weights.validate()?;
        }
        if self.workers == Some(0) {
            return Err(CmapError::Config("workers must be positive".into()));
        }
        Ok(())
    }

    /// Smallest signature accepted given the pre-filter gene count
    pub fn required_genes(&self, pre_filter_gene_count: usize) -> usize {
        let fractional = (self.min_fraction * pre_filter_gene_count as f64).ceil() as usize;
        self.min_genes.max(fractional)
    }

    /// Worker pool size for `n_cutoffs` tasks
    pub fn worker_count(&self, n_cutoffs: usize) -> usize {
        let workers = self.workers.unwrap_or_else(|| {
            let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
            cores.saturating_sub(1)
        });
        workers.min(n_cutoffs).max(1)
    }
}
