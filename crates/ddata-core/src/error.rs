//! Error types for replicated data operations.

use thiserror::Error;

/// Errors raised by CRDT mutators and cross-type merges.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CrdtError {
    #[error("Negative increments not supported for grow-only counters: {0}")]
    NegativeIncrement(i64),

    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Delta of type {delta} cannot be applied to {data}")]
    DeltaTypeMismatch {
        data: &'static str,
        delta: &'static str,
    },

    #[error("Replacing an observed-remove set value at key {0} would lose its history; update it in place instead")]
    ReplaceObservedRemoveValue(String),

    #[error("Modify failed: {0}")]
    Modify(String),
}

impl CrdtError {
    pub fn modify(message: impl Into<String>) -> Self {
        CrdtError::Modify(message.into())
    }
}

pub type Result<T> = std::result::Result<T, CrdtError>;
