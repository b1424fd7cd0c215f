//! Storage layer for registry-mirror.
//!
//! Provides RocksDB-backed storage with:
//! - Column family isolation for checkpoints, records and index metadata
//! - Prefix-ordered record keys for cursor-paged facet scans
//! - A cached, merge-on-save [`CheckpointStore`]
//! - [`LocalIndex`], the local [`mirror_types::SearchIndex`] implementation

pub mod checkpoint_store;
pub mod column_families;
pub mod db;
pub mod error;
pub mod keys;
pub mod local_index;

pub use checkpoint_store::{CheckpointStore, MAIN_CHECKPOINT};
pub use db::Storage;
pub use error::StorageError;
pub use keys::{CheckpointKey, RecordKey};
pub use local_index::LocalIndex;
