//! Error types for LLM provider implementations.

use thiserror::Error;

/// Result type for LLM operations.
pub type Result<T> = std::result::Result<T, LlmError>;

/// Retry classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// May succeed on a later attempt (timeouts, 429, 5xx, connection resets)
    Transient,
    /// Will not succeed on retry (auth failures, 4xx validation errors)
    Permanent,
}

/// Errors that can occur when talking to an LLM provider.
#[derive(Debug, Error)]
pub enum LlmError {
    /// HTTP request failed before a status was received.
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Request timed out.
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// API authentication failed (401/403).
    #[error("Authentication failed: {0}")]
    AuthenticationError(String),

    /// API key not found in environment.
    #[error("API key not found: {0}")]
    ApiKeyNotFound(String),

    /// Rate limit exceeded (429).
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Provider returned a 5xx status.
    #[error("Server error {status}: {body}")]
    ServerError { status: u16, body: String },

    /// Invalid request parameters (4xx other than auth and rate limit).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Response envelope could not be decoded.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error with context.
    #[error("{0}")]
    Other(String),
}

impl LlmError {
    /// Map an HTTP status and body to the matching error variant.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 | 403 => LlmError::AuthenticationError(body),
            408 => LlmError::Timeout(body),
            429 => LlmError::RateLimitExceeded(body),
            500..=599 => LlmError::ServerError { status, body },
            _ => LlmError::InvalidRequest(format!("status {}: {}", status, body)),
        }
    }

    /// Classify this error for retry decisions.
    pub fn classify(&self) -> ErrorClass {
        match self {
            LlmError::HttpError(err) => {
                if let Some(status) = err.status() {
                    if status.is_client_error() && status.as_u16() != 429 && status.as_u16() != 408
                    {
                        return ErrorClass::Permanent;
                    }
                }
                ErrorClass::Transient
            }
            LlmError::Timeout(_)
            | LlmError::RateLimitExceeded(_)
            | LlmError::ServerError { .. }
            | LlmError::InvalidResponse(_) => ErrorClass::Transient,
            LlmError::AuthenticationError(_)
            | LlmError::ApiKeyNotFound(_)
            | LlmError::InvalidRequest(_)
            | LlmError::ConfigError(_) => ErrorClass::Permanent,
            LlmError::Other(msg) => {
                let msg = msg.to_lowercase();
                if msg.contains("connection") || msg.contains("reset") || msg.contains("timed out") {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.classify() == ErrorClass::Transient
    }

    /// Check if this error is due to authentication.
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            LlmError::AuthenticationError(_) | LlmError::ApiKeyNotFound(_)
        )
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        LlmError::InvalidResponse(err.to_string())
    }
}
