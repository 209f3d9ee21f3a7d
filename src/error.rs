//! Error types for the Kopis library.
//!
//! All fallible operations in this crate return [`Result`], whose error type
//! is the [`KopisError`] enum. The variants mirror the failure classes a
//! caller has to handle differently: corruption is fatal to the operation,
//! a stale reader is recoverable by reopening, a lock failure is retryable,
//! and a merge abort is an ordinary cancellation signal.

use std::io;

use anyhow;
use thiserror::Error;

/// The main error type for Kopis operations.
#[derive(Error, Debug)]
pub enum KopisError {
    /// I/O errors (file operations, sync failures, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Unreadable or version-incompatible persisted structures.
    ///
    /// Never silently repaired; the operation that hit it fails.
    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    /// A reader attempted a mutation after the index advanced past the
    /// commit point it was opened on. Recoverable by reopening.
    #[error("Stale reader: {0}")]
    StaleReader(String),

    /// A named lock could not be obtained within the configured timeout.
    #[error("Lock failed: {0}")]
    LockFailed(String),

    /// Cooperative merge cancellation. Not a hard failure.
    #[error("Merge aborted")]
    MergeAborted,

    /// Unrecoverable resource exhaustion; the writer transitions to a
    /// poisoned state in which only close/rollback are permitted.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Index-related errors
    #[error("Index error: {0}")]
    Index(String),

    /// Invalid operation
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with KopisError.
pub type Result<T> = std::result::Result<T, KopisError>;

impl KopisError {
    /// Create a new corrupt-index error.
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        KopisError::CorruptIndex(msg.into())
    }

    /// Create a new stale-reader error.
    pub fn stale<S: Into<String>>(msg: S) -> Self {
        KopisError::StaleReader(msg.into())
    }

    /// Create a new lock-failure error.
    pub fn lock<S: Into<String>>(msg: S) -> Self {
        KopisError::LockFailed(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        KopisError::Storage(msg.into())
    }

    /// Create a new index error.
    pub fn index<S: Into<String>>(msg: S) -> Self {
        KopisError::Index(msg.into())
    }

    /// Create a new invalid-operation error.
    pub fn invalid_operation<S: Into<String>>(msg: S) -> Self {
        KopisError::InvalidOperation(msg.into())
    }

    /// Create a new resource-exhaustion error.
    pub fn exhausted<S: Into<String>>(msg: S) -> Self {
        KopisError::ResourceExhausted(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        KopisError::Other(msg.into())
    }

    /// True for the cooperative merge-cancellation signal.
    pub fn is_merge_abort(&self) -> bool {
        matches!(self, KopisError::MergeAborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = KopisError::corrupt("format version 99 is newer than supported");
        assert_eq!(
            error.to_string(),
            "Corrupt index: format version 99 is newer than supported"
        );

        let error = KopisError::stale("index advanced past generation 3");
        assert_eq!(
            error.to_string(),
            "Stale reader: index advanced past generation 3"
        );

        let error = KopisError::lock("write.lock");
        assert_eq!(error.to_string(), "Lock failed: write.lock");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let kopis_error = KopisError::from(io_error);

        match kopis_error {
            KopisError::Io(_) => {}
            _ => panic!("Expected IO error variant"),
        }
    }

    #[test]
    fn test_merge_abort_detection() {
        assert!(KopisError::MergeAborted.is_merge_abort());
        assert!(!KopisError::other("plain failure").is_merge_abort());
    }
}
