//! Common error types for index synchronization.

use thiserror::Error;

use crate::types::RecordKey;

/// Top-level error type for index synchronization operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The index or record store backend could not be reached.
    #[error("Adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// Batch size was zero or negative.
    #[error("Invalid batch size: {0} (must be positive)")]
    InvalidBatchSize(i64),

    /// A record inside a batch could not be serialized or indexed.
    #[error("Batch {batch} failed at record {key}: {reason}")]
    PartialBatchFailure {
        batch: u64,
        key: RecordKey,
        reason: String,
    },

    /// The index refused a single document.
    #[error("Document {key} rejected: {reason}")]
    DocumentRejected { key: RecordKey, reason: String },

    /// Store or index query failed while scanning for orphans.
    #[error("Orphan scan incomplete: {0}")]
    OrphanScanIncomplete(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation stopped by a cooperative cancel request.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_batch_failure_message() {
        let err = Error::PartialBatchFailure {
            batch: 2,
            key: RecordKey::Int(42),
            reason: "bad field".to_string(),
        };
        assert_eq!(err.to_string(), "Batch 2 failed at record 42: bad field");
    }
}
