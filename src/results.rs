use derive_new::new;
use serde::Serialize;

use crate::{math::median, qvalue::FdrPath, signature::GeneSignature};

/// Score and significance of one experiment at one cutoff
#[derive(Debug, Clone, PartialEq, Serialize, new)]
pub struct SignificanceRecord {
    pub experiment_id: String,
    pub drug: String,
    pub score: f64,
    pub p: f64,
    pub q: f64,
    pub cutoff: f64,
}
impl SignificanceRecord {
    /// A significant reversal: `q` below threshold with a negative score
    pub fn is_hit(&self, q_threshold: f64) -> bool {
        self.q < q_threshold && self.score < 0.0
    }
}

/// Terminal state of one cutoff
#[derive(Debug, Clone)]
pub enum ThresholdOutcome {
    Scored {
        signature: GeneSignature,
        records: Vec<SignificanceRecord>,
        fdr_path: FdrPath,
    },
    Skipped {
        reason: String,
        n_genes: usize,
    },
    Errored {
        cause: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CutoffStatus {
    Scored,
    Skipped,
    Errored,
}
impl std::fmt::Display for CutoffStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CutoffStatus::Scored => "scored",
            CutoffStatus::Skipped => "skipped",
            CutoffStatus::Errored => "errored",
        };
        write!(f, "{}", label)
    }
}

/// Result of one attempted cutoff
#[derive(Debug, Clone, new)]
pub struct ThresholdResult {
    pub cutoff: f64,
    pub outcome: ThresholdOutcome,
}
impl ThresholdResult {
    pub fn status(&self) -> CutoffStatus {
        match self.outcome {
            ThresholdOutcome::Scored { .. } => CutoffStatus::Scored,
            ThresholdOutcome::Skipped { .. } => CutoffStatus::Skipped,
            ThresholdOutcome::Errored { .. } => CutoffStatus::Errored,
        }
    }

    pub fn is_scored(&self) -> bool {
        self.status() == CutoffStatus::Scored
    }

    /// Genes kept in the signature, 0 for errored cutoffs
    pub fn n_genes(&self) -> usize {
        match &self.outcome {
            ThresholdOutcome::Scored { signature, .. } => signature.n_genes(),
            ThresholdOutcome::Skipped { n_genes, .. } => *n_genes,
            ThresholdOutcome::Errored { .. } => 0,
        }
    }

    /// All records of a scored cutoff, empty otherwise
    pub fn records(&self) -> &[SignificanceRecord] {
        match &self.outcome {
            ThresholdOutcome::Scored { records, .. } => records.as_slice(),
            _ => &[],
        }
    }

    pub fn hits(&self, q_threshold: f64) -> impl Iterator<Item = &SignificanceRecord> {
        self.records().iter().filter(move |r| r.is_hit(q_threshold))
    }

    pub fn summary(&self, q_threshold: f64) -> CutoffSummary {
        let qs = self.records().iter().map(|r| r.q).collect::<Vec<_>>();
        CutoffSummary {
            cutoff: self.cutoff,
            n_genes_kept: self.n_genes(),
            n_hits: self.hits(q_threshold).count(),
            median_q: median(&qs),
            status: self.status(),
        }
    }
}

/// One row of the cutoff summary table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CutoffSummary {
    pub cutoff: f64,
    pub n_genes_kept: usize,
    pub n_hits: usize,
    pub median_q: Option<f64>,
    pub status: CutoffStatus,
}

/// A drug whose reversal is supported across sweep cutoffs
#[derive(Debug, Clone, PartialEq, Serialize, new)]
pub struct RobustHit {
    pub drug: String,
    pub aggregated_score: f64,
    pub min_q: f64,
    pub n_support: usize,
}
