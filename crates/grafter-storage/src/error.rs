//! Storage error types for grafter-storage.
//!
//! [`StorageError`] covers the failure modes a record store reports back to the
//! engine. Constraint violations are surfaced as-is so callers can map them
//! to a conflict response.

use grafter_core::CoreError;
use thiserror::Error;

/// Errors produced by storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A row violates a uniqueness or integrity constraint.
    #[error("constraint violation on '{table}': {reason}")]
    Constraint { table: String, reason: String },

    /// The backend failed for a reason of its own.
    #[error("backend error: {reason}")]
    Backend { reason: String },

    /// The operation was abandoned before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// The eager loader was given an expression the schema cannot satisfy.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl StorageError {
    pub fn backend<T: Into<String>>(reason: T) -> Self {
        StorageError::Backend {
            reason: reason.into(),
        }
    }
}
