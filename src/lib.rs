//! cmapsweep: Connectivity Scoring with Threshold Sweeps
//!
//! This library scores how strongly drug perturbation profiles reverse a
//! disease gene-expression signature, using a Kolmogorov-Smirnov
//! connectivity statistic calibrated against a Monte Carlo null.
//!
//! The main components of this library are:
//! - `comparator`: the connectivity score between a signature and one ranked profile
//! - `generate_null`: permutation null distributions of connectivity scores
//! - `evaluate`: empirical p-values and q-values against a null
//! - `ThresholdSweep`: repeats scoring over a grid of effect-size cutoffs
//! - `aggregate`: consolidates sweep hits into robust consensus candidates

mod aggregate;
pub mod comparator;
mod config;
mod error;
mod grid;
mod library;
mod math;
mod null;
mod qvalue;
mod results;
mod signature;
mod significance;
mod sweep;
mod utils;

pub use aggregate::aggregate;
pub use comparator::ScoreMode;
pub use config::{AggregateFn, CutoffWeights, RobustRule, SweepConfig};
pub use error::{CmapError, Result};
pub use grid::{derive_grid, CutoffGrid};
pub use library::{Experiment, LibraryCache, ProfileLibrary, RankedProfile};
pub use null::{generate_null, NullCache, NullDistribution};
pub use qvalue::{FdrMethod, FdrPath};
pub use results::{
    CutoffStatus, CutoffSummary, RobustHit, SignificanceRecord, ThresholdOutcome,
    ThresholdResult,
};
pub use signature::{DiseaseTable, EffectColumn, GeneSignature, SignatureBuild, SignatureStrategy};
pub use significance::{evaluate, Evaluation, Significance};
pub use sweep::{SweepReport, ThresholdSweep};
pub use utils::cutoff_seed;
