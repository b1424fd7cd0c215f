//! Error types shared across the registry mirror.

use thiserror::Error;

/// Unified error type for configuration and domain validation.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid input error
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Errors raised by a [`Registry`](crate::Registry) implementation.
///
/// The variants map onto the pipeline's failure taxonomy: callers retry
/// `Transient` and `RateLimited`, record `NotFound` as terminal, and treat
/// `Fatal` as a configuration problem.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// The document or listing key does not exist upstream
    #[error("Not found: {0}")]
    NotFound(String),

    /// Upstream asked us to slow down (HTTP 429)
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Timeout, connection reset, 5xx
    #[error("Transient registry failure: {0}")]
    Transient(String),

    /// Malformed response or rejected credentials
    #[error("Registry error: {0}")]
    Fatal(String),
}

impl RegistryError {
    /// Whether a retry of the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RegistryError::RateLimited(_) | RegistryError::Transient(_))
    }
}

/// Errors raised by a [`SearchIndex`](crate::SearchIndex) implementation.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Backend storage failure
    #[error("Index backend error: {0}")]
    Backend(String),

    /// Record is missing an `objectID` or is not a JSON object
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// JSON encoding/decoding errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for IndexError {
    fn from(err: serde_json::Error) -> Self {
        IndexError::Serialization(err.to_string())
    }
}

/// Errors raised by enrichment collaborators (downloads, file listings).
#[derive(Debug, Clone, Error)]
pub enum EnrichError {
    /// The auxiliary source has no data for this package
    #[error("No data: {0}")]
    Missing(String),

    /// Network or upstream failure
    #[error("Enrichment source failed: {0}")]
    Source(String),
}
