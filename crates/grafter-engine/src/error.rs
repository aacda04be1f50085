//! Engine error types.
//!
//! [`UpsertError`] is the single error type returned by an upsert. Graph and
//! storage errors are wrapped unchanged; the engine adds the failures that
//! come out of pruning, validation and planning. Every variant except
//! `Storage` is raised before the first write is issued.

use grafter_core::CoreError;
use grafter_storage::StorageError;
use thiserror::Error;

/// Errors produced by an upsert.
#[derive(Debug, Error)]
pub enum UpsertError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The graph touches relations outside the allowed expression.
    #[error("trying to upsert an unallowed relation: {expression}")]
    UnallowedRelation { expression: String },

    /// A node carries an id that cannot be inserted, related or matched.
    #[error("{message} (at '{data_path}')")]
    NotFound { data_path: String, message: String },

    #[error("unsupported operation: {message}")]
    UnsupportedOperation { message: String },

    /// The insert dependency graph could not be ordered.
    #[error("the insert graph contains a cycle through {data_paths:?}")]
    CyclicGraph { data_paths: Vec<String> },

    /// A hook or validator rejected a record.
    #[error("validation failed for '{record_type}': {message}")]
    Validation { record_type: String, message: String },

    #[error("invalid options: {reason}")]
    InvalidOptions { reason: String },
}

/// Coarse classification callers can map to their transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The input or options are unacceptable.
    Validation,
    NotFound,
    /// The store rejected a write on a constraint.
    Conflict,
    Internal,
}

impl UpsertError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpsertError::Core(err) => match err {
                CoreError::InvalidGraph { .. }
                | CoreError::ReferenceNotFound { .. }
                | CoreError::InvalidExpression { .. } => ErrorKind::Validation,
                CoreError::UnknownRecordType { .. }
                | CoreError::UnknownRelation { .. }
                | CoreError::Schema { .. } => ErrorKind::Internal,
            },
            UpsertError::Storage(StorageError::Constraint { .. }) => ErrorKind::Conflict,
            UpsertError::Storage(_) => ErrorKind::Internal,
            UpsertError::NotFound { .. } => ErrorKind::NotFound,
            UpsertError::UnallowedRelation { .. }
            | UpsertError::UnsupportedOperation { .. }
            | UpsertError::CyclicGraph { .. }
            | UpsertError::Validation { .. }
            | UpsertError::InvalidOptions { .. } => ErrorKind::Validation,
        }
    }
}

pub type Result<T> = std::result::Result<T, UpsertError>;
