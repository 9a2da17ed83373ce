//! Client error types
//!
//! Maps transport failures and HTTP status codes to specific variants so the
//! transport can decide what is worth retrying. None of these ever reach the
//! orchestrator: the adapter turns them into a plain `false`.

use crate::archive::ArchiveError;

/// Errors raised while talking to the cache server
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Rate limited, try again after backoff")]
    RateLimited,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({0}): {1}")]
    Server(u16, String),

    #[error("Request timeout")]
    Timeout,

    #[error("Request error: {0}")]
    Request(String),

    #[error("Upload rejected for {0}")]
    Rejected(String),

    #[error("Invalid cache key: {0:?}")]
    InvalidHash(String),

    #[error("Invalid cache server address: {0}")]
    InvalidHost(String),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("Local I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Whether the request may succeed if sent again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::RateLimited
                | ClientError::Timeout
                | ClientError::Network(_)
                | ClientError::Server(_, _)
        )
    }

    /// Create a ClientError from an HTTP status code and response body
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            404 => ClientError::NotFound(body.to_string()),
            408 => ClientError::Timeout,
            429 => ClientError::RateLimited,
            500..=599 => ClientError::Server(status, body.to_string()),
            _ => ClientError::Request(format!("HTTP {}: {}", status, body)),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else if err.is_connect() {
            ClientError::Network(err.to_string())
        } else if let Some(status) = err.status() {
            ClientError::from_status(status.as_u16(), &err.to_string())
        } else {
            ClientError::Request(err.to_string())
        }
    }
}
