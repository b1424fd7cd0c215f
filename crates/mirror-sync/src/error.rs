//! Error types for the sync orchestrators.

use mirror_indexing::IndexingError;
use mirror_storage::StorageError;
use mirror_types::{IndexError, RegistryError};
use thiserror::Error;

/// Errors that stop a reader, prefetcher or orchestrator
#[derive(Error, Debug)]
pub enum SyncError {
    /// Checkpoint read or write failed
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] StorageError),

    /// Registry call failed and cannot be retried
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Search index operation failed
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    /// Indexer bookkeeping failed
    #[error("Indexing error: {0}")]
    Indexing(#[from] IndexingError),

    /// A background task panicked or was aborted
    #[error("Task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(err: tokio::task::JoinError) -> Self {
        SyncError::Task(err.to_string())
    }
}
