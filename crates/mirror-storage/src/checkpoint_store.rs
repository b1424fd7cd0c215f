//! Durable pipeline checkpoint with an in-process cache.
//!
//! All reads and writes go through one [`CheckpointStore`]. The cache is
//! guarded by a mutex held across the read-modify-write, so a `save` never
//! loses fields written by another in-process caller. The cache only moves
//! after the RocksDB write succeeds.

use std::sync::Arc;

use mirror_types::{Checkpoint, CheckpointPatch};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::db::Storage;
use crate::error::StorageError;

/// Checkpoint name used by the pipeline.
pub const MAIN_CHECKPOINT: &str = "main";

pub struct CheckpointStore {
    storage: Arc<Storage>,
    name: String,
    seed: bool,
    cache: Mutex<Option<Checkpoint>>,
}

impl CheckpointStore {
    pub fn new(storage: Arc<Storage>, seed: bool) -> Self {
        Self::with_name(storage, MAIN_CHECKPOINT, seed)
    }

    pub fn with_name(storage: Arc<Storage>, name: impl Into<String>, seed: bool) -> Self {
        Self {
            storage,
            name: name.into(),
            seed,
            cache: Mutex::new(None),
        }
    }

    /// Current checkpoint. Writes the zero value when none exists yet or
    /// when a re-seed was requested.
    pub async fn check(&self) -> Result<Checkpoint, StorageError> {
        let mut cache = self.cache.lock().await;

        if self.seed {
            info!(name = %self.name, "Seed requested, resetting checkpoint");
            return self.write(&mut cache, Checkpoint::default());
        }

        match self.load()? {
            Some(checkpoint) => {
                *cache = Some(checkpoint.clone());
                Ok(checkpoint)
            }
            None => {
                info!(name = %self.name, "No checkpoint found, starting fresh");
                self.write(&mut cache, Checkpoint::default())
            }
        }
    }

    /// Cached read; hits storage only on the first call after creation or
    /// [`CheckpointStore::invalidate`].
    pub async fn get(&self) -> Result<Checkpoint, StorageError> {
        let mut cache = self.cache.lock().await;
        if let Some(checkpoint) = cache.as_ref() {
            return Ok(checkpoint.clone());
        }
        let checkpoint = self.load()?.unwrap_or_default();
        *cache = Some(checkpoint.clone());
        Ok(checkpoint)
    }

    /// Merge `patch` over the latest state and persist it.
    pub async fn save(&self, patch: CheckpointPatch) -> Result<Checkpoint, StorageError> {
        let mut cache = self.cache.lock().await;
        let current = self.current(&cache)?;
        if patch.is_empty() {
            return Ok(current);
        }
        let next = current.merge(&patch);
        debug!(name = %self.name, ?patch, "Saving checkpoint");
        self.write(&mut cache, next)
    }

    /// Persist the zero-value checkpoint.
    pub async fn reset(&self) -> Result<Checkpoint, StorageError> {
        let mut cache = self.cache.lock().await;
        info!(name = %self.name, "Resetting checkpoint");
        self.write(&mut cache, Checkpoint::default())
    }

    /// Persist `key` as the bootstrap cursor only if it sorts after the
    /// stored one. Returns whether the cursor moved.
    pub async fn advance_last_key(&self, key: &str) -> Result<bool, StorageError> {
        let mut cache = self.cache.lock().await;
        let current = self.current(&cache)?;
        if let Some(stored) = current.bootstrap_last_key.as_deref() {
            if stored >= key {
                return Ok(false);
            }
        }
        self.write(&mut cache, current.merge(&CheckpointPatch::last_key(key)))?;
        Ok(true)
    }

    /// Drop the cached copy; the next read goes to storage.
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    fn current(&self, cache: &Option<Checkpoint>) -> Result<Checkpoint, StorageError> {
        match cache {
            Some(checkpoint) => Ok(checkpoint.clone()),
            None => Ok(self.load()?.unwrap_or_default()),
        }
    }

    fn load(&self) -> Result<Option<Checkpoint>, StorageError> {
        match self.storage.get_checkpoint(&self.name)? {
            Some(bytes) => Ok(Some(Checkpoint::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write(
        &self,
        cache: &mut Option<Checkpoint>,
        checkpoint: Checkpoint,
    ) -> Result<Checkpoint, StorageError> {
        self.storage
            .put_checkpoint(&self.name, &checkpoint.to_bytes()?)?;
        *cache = Some(checkpoint.clone());
        Ok(checkpoint)
    }
}
