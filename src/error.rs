use thiserror::Error;

/// Errors raised by the connectivity scoring engine
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CmapError {
    /// Malformed inputs: missing columns, mismatched lengths, empty library
    #[error("input shape error: {0}")]
    InputShape(String),

    /// A cutoff left no up- or down-regulated genes
    #[error("signature at cutoff {cutoff} contains no genes")]
    EmptySignature { cutoff: f64 },

    /// A cutoff left fewer genes than the configured minimum
    #[error("signature at cutoff {cutoff} has {n_genes} genes (minimum {required})")]
    InsufficientSignatureSize {
        cutoff: f64,
        n_genes: usize,
        required: usize,
    },

    /// All q-values collapsed to zero
    #[error("degenerate null distribution: {0}")]
    DegenerateNull(String),

    /// Invalid configuration values
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A cutoff task failed unexpectedly
    #[error("worker failure: {0}")]
    Worker(String),
}

impl CmapError {
    /// True for the conditions that gate a cutoff rather than fail it
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            CmapError::EmptySignature { .. } | CmapError::InsufficientSignatureSize { .. }
        )
    }

    /// True for the conditions that fail an entire sweep
    pub fn is_fatal(&self) -> bool {
        matches!(self, CmapError::InputShape(_) | CmapError::DegenerateNull(_))
    }
}

pub type Result<T> = std::result::Result<T, CmapError>;
