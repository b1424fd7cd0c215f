//! Error types for the indexer engine.

use mirror_types::{EnrichError, IndexError, RegistryError};
use thiserror::Error;

/// Errors that can occur while discovering or executing indexer work
#[derive(Error, Debug)]
pub enum IndexingError {
    /// Search index operation failed
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    /// Registry call failed
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Enrichment source failed
    #[error("Enrichment error: {0}")]
    Enrich(#[from] EnrichError),

    /// A discovered record could not be turned into a task
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// JSON encoding/decoding errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl IndexingError {
    /// Whether retrying the same work later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            IndexingError::Registry(e) => e.is_retryable(),
            IndexingError::Enrich(EnrichError::Source(_)) => true,
            IndexingError::Index(IndexError::Backend(_)) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for IndexingError {
    fn from(err: serde_json::Error) -> Self {
        IndexingError::Serialization(err.to_string())
    }
}
