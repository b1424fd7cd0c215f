//! Error types for the HTTP collaborators.

use mirror_types::{EnrichError, RegistryError};
use thiserror::Error;

/// Errors from a single HTTP exchange.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Invalid URL: {0}")]
    Url(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            ClientError::Request(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Timeouts, dropped connections and 5xx responses.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ClientError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<ClientError> for RegistryError {
    fn from(err: ClientError) -> Self {
        match err.status() {
            Some(404) => RegistryError::NotFound(err.to_string()),
            Some(429) => RegistryError::RateLimited(err.to_string()),
            _ if err.is_transient() => RegistryError::Transient(err.to_string()),
            _ => RegistryError::Fatal(err.to_string()),
        }
    }
}

impl From<ClientError> for EnrichError {
    fn from(err: ClientError) -> Self {
        match err.status() {
            Some(404) => EnrichError::Missing(err.to_string()),
            _ => EnrichError::Source(err.to_string()),
        }
    }
}
