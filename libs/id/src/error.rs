//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("{kind} ID cannot be empty")]
    Empty { kind: &'static str },

    /// The UUID portion of the ID is invalid.
    #[error("invalid {kind} ID '{input}': {message}")]
    InvalidUuid {
        kind: &'static str,
        input: String,
        message: String,
    },

    /// The derivation key was blank.
    #[error("cannot derive {kind} ID from a blank key")]
    BlankDerivationKey { kind: &'static str },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty { .. } | IdError::BlankDerivationKey { .. })
    }
}
