//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (validation, unknown
/// identifiers). Broker and transport concerns belong to the infra layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. empty run id).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A step name outside the workflow vocabulary.
    #[error("unknown step: {0}")]
    UnknownStep(String),

    /// A requested resource was not found.
    #[error("not found")]
    NotFound,
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn unknown_step(name: impl Into<String>) -> Self {
        Self::UnknownStep(name.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }
}
