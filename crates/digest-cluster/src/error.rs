use thiserror::Error;

/// Errors raised by the clustering pipeline.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClusteringError {
    #[error("invalid clustering parameter: {0}")]
    InvalidParameter(String),
    #[error("non-finite values detected in '{stage}'")]
    NonFinite { stage: &'static str },
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl ClusteringError {
    pub(crate) fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter(message.into())
    }
}
