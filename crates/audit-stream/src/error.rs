//! Error types for audit event delivery

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    /// Missing or invalid destination configuration (e.g. credentials).
    #[error("Configuration error: {0}")]
    Config(String),

    /// The destination answered with a non-2xx status.
    #[error("Request failed with status {status}: {body}")]
    Request { status: u16, body: String },

    /// The destination could not be reached.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),

    /// The destination answered with something we could not parse.
    #[error("Error: unexpected response: {0}")]
    Parse(String),

    #[error("{0}")]
    Argument(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StreamError {
    /// Short machine-readable kind, used in delivery results and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamError::Config(_) => "config",
            StreamError::Request { .. } => "request",
            StreamError::Transport(_) => "transport",
            StreamError::Timeout(_) => "timeout",
            StreamError::Parse(_) => "parse",
            StreamError::Argument(_) => "argument",
            StreamError::Serialization(_) => "serialization",
        }
    }

    /// Whether the destination was unreachable or refused the request.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            StreamError::Request { .. } | StreamError::Transport(_) | StreamError::Timeout(_)
        )
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            StreamError::Request { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StreamError::Transport(format!("timeout: {}", err))
        } else {
            StreamError::Transport(err.to_string())
        }
    }
}

/// Result type for streaming operations
pub type Result<T> = std::result::Result<T, StreamError>;
