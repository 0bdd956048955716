//! Error types for signalforge
//!
//! Every fatal path out of [`TaskPipeline::submit`](crate::TaskPipeline::submit)
//! is one of these variants. Malformed provider content never is: the
//! interpreter resolves it locally into a `Fallback` outcome.

use crate::budget::BudgetScope;
use crate::outcome::ErrorKind;
use crate::task::TaskState;
use thiserror::Error;

/// Result type alias for signalforge operations
pub type Result<T> = std::result::Result<T, SignalError>;

/// Errors surfaced by the orchestration core.
///
/// Payloads are owned strings so the error is `Clone`; coalesced cache
/// waiters all receive a copy of the leader's failure.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SignalError {
    /// Reservation would push a budget scope past its limit
    #[error("{scope} budget exceeded: requested {requested} tokens, {remaining} remaining")]
    BudgetExceeded {
        scope: BudgetScope,
        requested: u64,
        remaining: u64,
    },

    /// The task deadline elapsed before the provider answered
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// Provider rejected our credentials
    #[error("Upstream authentication failed: {0}")]
    UpstreamAuthError(String),

    /// Transient failures persisted past the retry cap
    #[error("Network error after {attempts} attempts: {last}")]
    NetworkError { attempts: u32, last: String },

    /// Provider refused the request for a non-auth reason (4xx validation)
    #[error("Upstream rejected request: {0}")]
    UpstreamRejected(String),

    /// Programming error inside the core (double commit, unknown reservation)
    #[error("Internal fault: {0}")]
    InternalFault(String),

    /// Illegal task lifecycle edge
    #[error("Invalid task state transition: {from:?} -> {to:?}")]
    InvalidStateTransition { from: TaskState, to: TaskState },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl SignalError {
    /// Kind recorded in usage records for this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SignalError::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            SignalError::UpstreamTimeout(_) => ErrorKind::UpstreamTimeout,
            SignalError::UpstreamAuthError(_) => ErrorKind::UpstreamAuth,
            SignalError::NetworkError { .. } => ErrorKind::Network,
            SignalError::UpstreamRejected(_) => ErrorKind::UpstreamRejected,
            SignalError::InternalFault(_)
            | SignalError::InvalidStateTransition { .. }
            | SignalError::Config(_)
            | SignalError::Io(_)
            | SignalError::Serialization(_) => ErrorKind::Internal,
        }
    }
}

impl From<std::io::Error> for SignalError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for SignalError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for SignalError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("Failed to parse config: {}", err))
    }
}
