//! Error types for the control plane client.

use reqwest::StatusCode;
use thiserror::Error;

/// Errors that can occur when talking to the control plane.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Failed to reach the server.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Transport-level HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The server rejected the request.
    #[error("server returned {status}: {message}")]
    Api { status: StatusCode, message: String },

    /// Bad user input, caught before any request was sent.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ClientError {
    /// Build an error from a non-success response body.
    ///
    /// The server sends `{"error": "..."}`; anything else is passed through raw.
    pub fn from_response(status: StatusCode, body: &str) -> Self {
        let message = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or_else(|| body.trim().to_string());

        if status == StatusCode::NOT_FOUND {
            ClientError::NotFound(message)
        } else {
            ClientError::Api { status, message }
        }
    }

    /// True when retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Connection(_) => true,
            ClientError::Http(e) => e.is_timeout() || e.is_connect(),
            ClientError::Api { status, .. } => {
                *status == StatusCode::CONFLICT || status.is_server_error()
            }
            _ => false,
        }
    }
}
