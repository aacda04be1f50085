//! Core error types for grafter-core.
//!
//! Uses `thiserror` for structured, matchable error variants covering the
//! failure modes of schema loading, relation expressions, and graph
//! construction. All of them are raised before any storage I/O happens.

use thiserror::Error;

/// Core errors produced by the grafter-core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A value found where a record was required, or a malformed marker.
    #[error("invalid graph at '{data_path}': {message}")]
    InvalidGraph { data_path: String, message: String },

    /// A `#ref`, or a `#ref{..}` inside a string, names a uid that was never
    /// declared with `#id` in the same graph.
    #[error("could not resolve reference '{uid}' at '{data_path}'")]
    ReferenceNotFound { uid: String, data_path: String },

    /// No record type with this name is registered in the schema.
    #[error("unknown record type: '{name}'")]
    UnknownRecordType { name: String },

    /// The record type declares no relation with this name.
    #[error("record type '{record_type}' has no relation '{relation}'")]
    UnknownRelation { record_type: String, relation: String },

    /// A relation expression could not be parsed.
    #[error("invalid relation expression '{input}': {reason}")]
    InvalidExpression { input: String, reason: String },

    /// The schema is malformed or internally inconsistent.
    #[error("schema error: {reason}")]
    Schema { reason: String },
}

impl CoreError {
    pub fn invalid_graph<P: Into<String>, M: Into<String>>(data_path: P, message: M) -> Self {
        CoreError::InvalidGraph {
            data_path: data_path.into(),
            message: message.into(),
        }
    }

    pub fn schema<T: Into<String>>(reason: T) -> Self {
        CoreError::Schema {
            reason: reason.into(),
        }
    }
}
