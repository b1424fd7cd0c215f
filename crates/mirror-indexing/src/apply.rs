//! Apply one change-feed entry to the production index.
//!
//! Used by the watch orchestrator for in-order inline application and by
//! the watch indexer for changes parked after a transient failure. Both
//! sides fetch with [`ChangeApplier::prepare`] and write with
//! [`ChangeApplier::commit`] while holding the package lock, so a parked
//! change replayed late can check under the lock that nothing newer for
//! the package has been written meanwhile.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::Utc;
use mirror_types::{format_document, object_id, Change, Registry, RegistryError, SearchIndex};
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::IndexingError;

/// Lock stripes shared by every clone of one applier.
const LOCK_STRIPES: usize = 64;

/// Result of applying a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Deleted,
    Upserted,
    /// Document has no usable record (design doc, unpublished)
    Dropped,
    /// Revision is gone upstream
    NotFound(String),
}

/// A change fetched and formatted, not yet written.
#[derive(Debug, Clone, PartialEq)]
pub enum Prepared {
    Delete,
    Upsert(Value),
    Dropped,
    NotFound(String),
}

/// Fields owned by the periodic indexer, carried over from the data index
const PERIODIC_FIELDS: &[&str] = &[
    "downloadsLast30Days",
    "humanDownloadsLast30Days",
    "downloadsRatio",
    "popular",
    mirror_types::PERIODIC_FACET,
];

/// Clones share registry, index and package locks.
#[derive(Clone)]
pub struct ChangeApplier {
    registry: Arc<dyn Registry>,
    index: Arc<dyn SearchIndex>,
    production: String,
    data: String,
    locks: Arc<Vec<Mutex<()>>>,
}

impl ChangeApplier {
    pub fn new(
        registry: Arc<dyn Registry>,
        index: Arc<dyn SearchIndex>,
        production: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            index,
            production: production.into(),
            data: data.into(),
            locks: Arc::new((0..LOCK_STRIPES).map(|_| Mutex::new(())).collect()),
        }
    }

    /// Serialize writes for one package. Never held across a registry call.
    pub async fn lock(&self, object_id: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        object_id.hash(&mut hasher);
        let stripe = (hasher.finish() % LOCK_STRIPES as u64) as usize;
        self.locks[stripe].lock().await
    }

    /// Fetch, format and enrich. Transient upstream failures are returned
    /// as errors for the caller to park or retry.
    pub async fn prepare(&self, change: &Change) -> Result<Prepared, IndexingError> {
        if change.deleted {
            return Ok(Prepared::Delete);
        }

        let doc = match self.registry.get_document(&change.id, change.revision()).await {
            Ok(doc) => doc,
            Err(RegistryError::NotFound(msg)) => return Ok(Prepared::NotFound(msg)),
            Err(e) => return Err(e.into()),
        };

        let Some(mut record) = format_document(&doc, Utc::now()) else {
            debug!(object_id = %change.id, "No usable record");
            return Ok(Prepared::Dropped);
        };
        self.enrich(&mut record).await;
        Ok(Prepared::Upsert(record))
    }

    /// Write a prepared change. Callers hold [`ChangeApplier::lock`].
    pub async fn commit(&self, change: &Change, prepared: Prepared) -> Result<Applied, IndexingError> {
        match prepared {
            Prepared::Delete => {
                self.index.delete(&self.production, &change.id).await?;
                debug!(object_id = %change.id, seq = change.sequence, "Deleted");
                Ok(Applied::Deleted)
            }
            Prepared::Upsert(record) => {
                self.index.upsert(&self.production, record).await?;
                debug!(object_id = %change.id, seq = change.sequence, "Upserted");
                Ok(Applied::Upserted)
            }
            Prepared::Dropped => Ok(Applied::Dropped),
            Prepared::NotFound(msg) => Ok(Applied::NotFound(msg)),
        }
    }

    /// Prepare, then commit under the package lock.
    pub async fn apply(&self, change: &Change) -> Result<Applied, IndexingError> {
        let prepared = self.prepare(change).await?;
        let _guard = self.lock(&change.id).await;
        self.commit(change, prepared).await
    }

    /// Carry over download data computed by the periodic indexer. Without
    /// it the record stays due and the periodic indexer fills it in.
    async fn enrich(&self, record: &mut Value) {
        let Some(id) = object_id(record).map(str::to_string) else {
            return;
        };
        let data = match self.index.get(&self.data, &id).await {
            Ok(Some(data)) => data,
            Ok(None) => return,
            Err(e) => {
                warn!(object_id = %id, error = %e, "Could not read periodic data");
                return;
            }
        };
        if let Some(fields) = record.as_object_mut() {
            for key in PERIODIC_FIELDS {
                if let Some(value) = data.get(*key) {
                    fields.insert((*key).to_string(), value.clone());
                }
            }
        }
    }
}
