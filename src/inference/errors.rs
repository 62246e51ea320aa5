//! Inference error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility: these types carry the context needed to
//! build meaningful log entries.

use thiserror::Error;

/// Errors that can occur while calling the LLM endpoint.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the model endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The model endpoint did not respond within the configured timeout.
    #[error("inference timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Non-2xx HTTP response from the model endpoint.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The response body could not be read or understood.
    #[error("invalid completion response: {reason}")]
    ResponseError { reason: String },

    /// Configuration error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_error_display_carries_status_and_body() {
        let err = InferenceError::HttpError {
            status: 429,
            body: "rate limited".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 429: rate limited");
    }

    #[test]
    fn test_timeout_display() {
        let err = InferenceError::Timeout { duration_secs: 120 };
        assert_eq!(err.to_string(), "inference timeout after 120s");
    }
}
