//! Error types for Tally
//!
//! This module defines the common error types used throughout the system.

use crate::types::CounterType;
use thiserror::Error;

/// Common result type for Tally operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Tally
#[derive(Debug, Error)]
pub enum Error {
    // Counter errors
    #[error("version mismatch on {key}: expected {expected}, stored {actual}")]
    VersionMismatch {
        key: String,
        expected: i64,
        actual: i64,
    },

    #[error("invalid counter type: {0}")]
    InvalidCounterType(String),

    #[error("unsupported counter type for reconciliation: {0}")]
    UnsupportedCounterType(CounterType),

    // Backend errors
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("script unavailable: {0}")]
    ScriptUnavailable(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    // Saga errors
    #[error("saga {saga} failed at step {step}: {source}")]
    SagaStepFailure {
        saga: String,
        step: String,
        #[source]
        source: Box<Error>,
    },

    #[error("saga {saga} already executed (state: {state})")]
    SagaAlreadyExecuted { saga: String, state: String },

    // Internal errors
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a backend unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::BackendUnavailable(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable(_) | Self::ScriptUnavailable(_) | Self::VersionMismatch { .. }
        )
    }

    /// The innermost error, looking through saga step wrappers
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::SagaStepFailure { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Get HTTP status code for callers rendering this error
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::InvalidCounterType(_) | Self::UnsupportedCounterType(_) => 400,

            // 404 Not Found
            Self::NotFound(_) => 404,

            // 409 Conflict
            Self::VersionMismatch { .. } | Self::SagaAlreadyExecuted { .. } => 409,

            // 503 Service Unavailable
            Self::BackendUnavailable(_) | Self::ScriptUnavailable(_) => 503,

            Self::SagaStepFailure { source, .. } => source.http_status_code(),

            // 500 Internal Server Error
            Self::Storage(_)
            | Self::Serialization(_)
            | Self::Configuration(_)
            | Self::Internal(_) => 500,
        }
    }
}
