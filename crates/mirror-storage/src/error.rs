//! Storage layer error types.

use mirror_types::{IndexError, MirrorError};
use thiserror::Error;

/// Errors that can occur in the storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// RocksDB operation failed
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// Column family not found
    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),

    /// Key encoding/decoding error
    #[error("Key error: {0}")]
    Key(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<MirrorError> for StorageError {
    fn from(err: MirrorError) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<StorageError> for IndexError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Serialization(msg) => IndexError::Serialization(msg),
            StorageError::Key(msg) => IndexError::InvalidRecord(msg),
            other => IndexError::Backend(other.to_string()),
        }
    }
}
