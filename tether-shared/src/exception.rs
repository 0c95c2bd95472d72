use std::fmt;

use thiserror::Error;

/// Tether-specific error types
#[derive(Debug, Error)]
pub enum TetherError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Invalid filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("No provider available for {specification} after {waited_ms}ms")]
    ServiceUnavailable {
        specification: String,
        waited_ms: u64,
    },

    #[error("Interceptor error in dependency {dependency}: {reason}")]
    InterceptorError { dependency: String, reason: String },

    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TetherError {
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        TetherError::ConfigurationError(msg.into())
    }

    pub fn filter<F: Into<String>, R: Into<String>>(filter: F, reason: R) -> Self {
        TetherError::InvalidFilter {
            filter: filter.into(),
            reason: reason.into(),
        }
    }

    pub fn unavailable<S: Into<String>>(specification: S, waited_ms: u64) -> Self {
        TetherError::ServiceUnavailable {
            specification: specification.into(),
            waited_ms,
        }
    }

    pub fn interceptor<D: Into<String>, R: Into<String>>(dependency: D, reason: R) -> Self {
        TetherError::InterceptorError {
            dependency: dependency.into(),
            reason: reason.into(),
        }
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        TetherError::Internal(msg.into())
    }
}

/// Result type for Tether operations
pub type TetherResult<T> = Result<T, TetherError>;

/// Reason a coordination terminated exceptionally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The coordination deadline elapsed before `end` or `fail` was called.
    Timeout,
    /// Explicit failure with an application-supplied reason.
    Error(String),
}

impl FailureCause {
    pub fn error<S: Into<String>>(reason: S) -> Self {
        FailureCause::Error(reason.into())
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Timeout => write!(f, "timeout"),
            FailureCause::Error(reason) => write!(f, "{}", reason),
        }
    }
}

/// Typed, reason-coded errors raised when interacting with a coordination.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("Coordination {id}/{name} has already terminated")]
    AlreadyEnded { id: u64, name: String },

    #[error("Coordination {id}/{name} failed: {cause}")]
    Failed {
        id: u64,
        name: String,
        cause: FailureCause,
    },

    #[error("Coordination {id}/{name} timed out")]
    Timeout { id: u64, name: String },

    #[error("One or more participants failed while ending coordination {id}/{name}")]
    PartiallyEnded { id: u64, name: String },
}

impl CoordinationError {
    /// The numeric id of the coordination this error refers to.
    pub fn coordination_id(&self) -> u64 {
        match self {
            CoordinationError::AlreadyEnded { id, .. }
            | CoordinationError::Failed { id, .. }
            | CoordinationError::Timeout { id, .. }
            | CoordinationError::PartiallyEnded { id, .. } => *id,
        }
    }
}
