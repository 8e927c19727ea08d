//! Inference error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility — these types carry the context needed to build
//! meaningful log entries.

use thiserror::Error;

/// Errors that can occur during inference operations.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the model endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The model endpoint did not respond within the configured timeout.
    #[error("inference timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Every model in the fallback chain was unavailable.
    #[error("all models unavailable (tried: {})", attempted.join(", "))]
    AllModelsUnavailable { attempted: Vec<String> },

    /// Non-2xx HTTP response from the model endpoint.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// SSE stream parsing or chunk-level error.
    #[error("stream error: {reason}")]
    StreamError { reason: String },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl InferenceError {
    /// Whether the failure is a provider-side condition that retrying later
    /// may resolve: timeouts, rate limits, quota, auth, or connectivity.
    ///
    /// Transient errors abort the current turn with a retry-later message
    /// instead of being fed back to the model.
    pub fn is_transient(&self) -> bool {
        match self {
            InferenceError::ConnectionFailed { .. }
            | InferenceError::Timeout { .. }
            | InferenceError::AllModelsUnavailable { .. } => true,
            InferenceError::HttpError { status, .. } => {
                matches!(*status, 401 | 402 | 403 | 408 | 429 | 502..=504)
            }
            InferenceError::StreamError { .. } | InferenceError::ConfigError { .. } => false,
        }
    }

    /// Human-readable category for the retry-later message.
    pub fn transient_kind(&self) -> &'static str {
        match self {
            InferenceError::Timeout { .. } | InferenceError::HttpError { status: 408, .. } => {
                "timeout"
            }
            InferenceError::HttpError { status: 429, .. } => "rate limit",
            InferenceError::HttpError { status: 402, .. } => "quota exhausted",
            InferenceError::HttpError {
                status: 401 | 403, ..
            } => "authentication",
            _ => "connectivity",
        }
    }

    /// Extract the error body text, if this is an `HttpError`.
    pub fn error_body(&self) -> Option<&str> {
        match self {
            InferenceError::HttpError { body, .. } => Some(body),
            _ => None,
        }
    }
}
