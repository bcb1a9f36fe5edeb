//! Error types for likelihood evaluation.
//!
//! Two failures are retryable and are handled by the evaluation loop in
//! [`crate::likelihood::TreeDataLikelihood`]: [`Error::Underflow`] and
//! [`Error::RescaleRequested`]. Everything else is fatal for the current
//! evaluation and is returned to the caller unchanged.
//!
//! Buffer protocol violations (flipping an un-mirrored index, indices out of
//! range) are programmer errors and panic instead of producing a value here.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building or evaluating a likelihood.
#[derive(Debug, Error)]
pub enum Error {
    /// One or more partitions produced a non-finite log-likelihood.
    ///
    /// The delegate has already forced scale-factor recomputation for the
    /// listed partitions; the caller retries with all nodes dirty.
    #[error("likelihood underflow in partitions {partitions:?}")]
    Underflow { partitions: Vec<usize> },

    /// Periodic scale-factor recomputation needs a full traversal.
    ///
    /// Raised before any backend work is submitted, so retrying is free.
    #[error("scale factor recomputation requested")]
    RescaleRequested,

    /// The underflow retry cap was reached without a valid value.
    #[error("likelihood evaluation failed after {attempts} attempts")]
    RetryLimitExceeded { attempts: usize },

    /// A branch had a negative length, so the tree heights are inconsistent.
    #[error("negative branch length {length} for node {node}")]
    NegativeBranchLength { node: usize, length: f64 },

    #[error("invalid tree: {0}")]
    InvalidTree(String),

    #[error("invalid pattern data: {0}")]
    InvalidPatterns(String),

    #[error("taxon '{0}' not found in pattern data")]
    MissingTaxon(String),

    #[error("invalid model: {0}")]
    InvalidModel(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl Error {
    /// Whether the evaluation loop handles this error by retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Underflow { .. } | Error::RescaleRequested)
    }
}

/// Errors reported by a [`crate::backend::ComputeBackend`].
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("partition {0} has not been allocated")]
    UnallocatedPartition(usize),

    #[error("{kind} buffer {index} out of range (partition {partition}, capacity {capacity})")]
    BufferOutOfRange {
        kind: &'static str,
        partition: usize,
        index: usize,
        capacity: usize,
    },

    #[error("{kind} buffer {index} read before it was written (partition {partition})")]
    UninitializedBuffer {
        kind: &'static str,
        partition: usize,
        index: usize,
    },

    #[error("dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Underflow { partitions: vec![0] }.is_retryable());
        assert!(Error::RescaleRequested.is_retryable());
        assert!(!Error::RetryLimitExceeded { attempts: 100 }.is_retryable());
        assert!(!Error::NegativeBranchLength { node: 1, length: -0.5 }.is_retryable());
    }

    #[test]
    fn test_backend_error_converts() {
        let err: Error = BackendError::UnallocatedPartition(3).into();
        assert!(matches!(err, Error::Backend(BackendError::UnallocatedPartition(3))));
        assert_eq!(err.to_string(), "partition 3 has not been allocated");
    }
}
