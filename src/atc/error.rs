//! Error types for the orchestrator HTTP client.

use std::fmt;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::config::ConfigError;

/// Orchestrator call that failed, used to give errors context.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    /// `POST /api/v1/pipes`.
    OpenChannel,
    /// `PUT /api/v1/pipes/{id}`.
    Upload,
    /// `POST /api/v1/builds`.
    Submit,
    /// `GET /api/v1/builds/{id}/events`.
    Events,
    /// `POST /api/v1/builds/{id}/abort`.
    Abort,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OpenChannel => "open bits channel",
            Self::Upload => "upload bits",
            Self::Submit => "create build",
            Self::Events => "stream build events",
            Self::Abort => "abort build",
        })
    }
}

/// Errors raised while talking to the orchestrator.
#[derive(Debug, Error)]
pub enum AtcError {
    /// Raised when the client configuration is unusable.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when the request could not be sent or the response not read.
    #[error("failed to {operation}: {source}")]
    Http {
        /// Call that failed.
        operation: Operation,
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },
    /// Raised when the orchestrator answers with a non-success status.
    #[error("failed to {operation}: unexpected status {status}: {body}")]
    UnexpectedStatus {
        /// Call that failed.
        operation: Operation,
        /// HTTP status code returned.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },
    /// Raised when a response or frame cannot be decoded.
    #[error("failed to {operation}: {message}")]
    Decode {
        /// Call that failed.
        operation: Operation,
        /// Decoder error text.
        message: String,
    },
    /// Raised when the event connection fails.
    #[error("event connection failed: {0}")]
    WebSocket(#[source] Box<tungstenite::Error>),
}

impl From<tungstenite::Error> for AtcError {
    fn from(value: tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

impl From<ConfigError> for AtcError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}

/// Returns `response` when its status is a success, otherwise an
/// [`AtcError::UnexpectedStatus`] carrying the body text.
pub(crate) async fn ensure_success(
    operation: Operation,
    response: reqwest::Response,
) -> Result<reqwest::Response, AtcError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(AtcError::UnexpectedStatus {
        operation,
        status: status.as_u16(),
        body,
    })
}
