//! Errors raised by the job domain itself.

use thiserror::Error;

use crate::job::JobState;

pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic domain failures. Storage and transport problems are
/// reported by the crates that own those concerns.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// The job state machine does not allow `from -> to`.
    #[error("job cannot move from {from:?} to {to:?}")]
    InvalidTransition { from: JobState, to: JobState },

    /// An identifier could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_transition(from: JobState, to: JobState) -> Self {
        Self::InvalidTransition { from, to }
    }
}
