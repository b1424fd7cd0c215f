//! Periodic background strategy: download counts and popularity.
//!
//! Unscoped packages are grouped into batches for the bulk downloads API;
//! scoped packages are not accepted in bulk and always run alone. A package
//! with no recorded downloads that was created long ago may have been
//! removed upstream without a change event, so the registry is asked before
//! anything is deleted.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use mirror_types::{
    due_bucket, is_scoped, object_id, DownloadTotals, Downloads, MovedBy, NotFoundEntry, Registry,
    RegistryError, SearchIndex, PERIODIC_FACET,
};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::engine::{IndexTask, IndexerStrategy, Outcome};
use crate::error::IndexingError;

/// Days before a failed refresh is attempted again.
pub const PERIODIC_RETRY_DAYS: i64 = 1;

/// Package reference carried by a periodic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRef {
    pub name: String,
    /// Creation time in milliseconds
    pub created: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeriodicBatch {
    pub packages: Vec<PackageRef>,
}

impl IndexTask for PeriodicBatch {
    fn object_ids(&self) -> Vec<&str> {
        self.packages.iter().map(|p| p.name.as_str()).collect()
    }
}

/// Index names the periodic strategy writes to.
#[derive(Debug, Clone)]
pub struct PeriodicIndices {
    pub production: String,
    pub data: String,
    pub not_found: String,
}

/// Refresh and deletion-check intervals.
#[derive(Debug, Clone)]
pub struct PeriodicConfig {
    pub batch_size: usize,
    pub refresh: Duration,
    pub deleted_check_min_age: Duration,
}

pub struct PeriodicStrategy {
    registry: Arc<dyn Registry>,
    index: Arc<dyn SearchIndex>,
    downloads: Arc<dyn Downloads>,
    totals: Arc<DownloadTotals>,
    indices: PeriodicIndices,
    config: PeriodicConfig,
    pending: Mutex<Vec<PackageRef>>,
}

impl PeriodicStrategy {
    pub fn new(
        registry: Arc<dyn Registry>,
        index: Arc<dyn SearchIndex>,
        downloads: Arc<dyn Downloads>,
        totals: Arc<DownloadTotals>,
        indices: PeriodicIndices,
        config: PeriodicConfig,
    ) -> Self {
        Self {
            registry,
            index,
            downloads,
            totals,
            indices,
            config,
            pending: Mutex::new(Vec::new()),
        }
    }

    async fn reschedule(&self, name: &str, due: DateTime<Utc>) -> Result<(), IndexingError> {
        self.index
            .upsert_partial(
                &self.indices.production,
                json!({"objectID": name, PERIODIC_FACET: due_bucket(due)}),
                false,
            )
            .await?;
        Ok(())
    }

    fn deletion_suspect(&self, package: &PackageRef, downloads: u64, now: DateTime<Utc>) -> bool {
        let cutoff = (now - self.config.deleted_check_min_age).timestamp_millis();
        downloads == 0 && package.created.is_some_and(|created| created < cutoff)
    }

    /// Ask the registry whether `name` still exists; remove it everywhere
    /// when it does not. Returns whether it was removed.
    async fn confirm_deleted(&self, name: &str) -> Result<bool, IndexingError> {
        match self.registry.get_document(name, None).await {
            Ok(_) => Ok(false),
            Err(RegistryError::NotFound(msg)) => {
                self.index.delete(&self.indices.data, name).await?;
                self.index.delete(&self.indices.production, name).await?;
                let entry = NotFoundEntry::new(name, msg, MovedBy::PeriodicIndexer);
                self.index
                    .upsert(&self.indices.not_found, entry.to_record()?)
                    .await?;
                info!(object_id = %name, "Removed package deleted upstream");
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn refresh(&self, name: &str, downloads: u64, now: DateTime<Utc>) -> Result<(), IndexingError> {
        let mut fields = self.totals.popularity(downloads);
        if let Some(obj) = fields.as_object_mut() {
            obj.insert("objectID".into(), json!(name));
            obj.insert(
                PERIODIC_FACET.into(),
                json!(due_bucket(now + self.config.refresh)),
            );
        }
        self.index
            .upsert_partial(&self.indices.production, fields.clone(), false)
            .await?;
        self.index.upsert(&self.indices.data, fields).await?;
        Ok(())
    }
}

#[async_trait]
impl IndexerStrategy for PeriodicStrategy {
    type Task = PeriodicBatch;

    fn name(&self) -> &'static str {
        "periodic"
    }

    fn index_name(&self) -> &str {
        &self.indices.production
    }

    fn facet_field(&self) -> &'static str {
        PERIODIC_FACET
    }

    /// Due timestamps at or before now.
    fn facet_filter(&self, value: &str, now: DateTime<Utc>) -> bool {
        value
            .parse::<i64>()
            .is_ok_and(|due| due <= now.timestamp_millis())
    }

    async fn on_record(&self, hit: Value) -> Result<Vec<Self::Task>, IndexingError> {
        let name = object_id(&hit)
            .ok_or_else(|| IndexingError::InvalidRecord("missing objectID".to_string()))?
            .to_string();
        let package = PackageRef {
            created: hit.get("created").and_then(Value::as_i64),
            name,
        };

        if is_scoped(&package.name) {
            return Ok(vec![PeriodicBatch {
                packages: vec![package],
            }]);
        }

        let mut pending = self.pending.lock().await;
        if pending.iter().any(|p| p.name == package.name) {
            return Ok(Vec::new());
        }
        pending.push(package);
        if pending.len() < self.config.batch_size {
            return Ok(Vec::new());
        }
        Ok(vec![PeriodicBatch {
            packages: std::mem::take(&mut *pending),
        }])
    }

    async fn flush(&self) -> Vec<Self::Task> {
        let mut pending = self.pending.lock().await;
        if pending.is_empty() {
            return Vec::new();
        }
        vec![PeriodicBatch {
            packages: std::mem::take(&mut *pending),
        }]
    }

    async fn execute(&self, batch: &Self::Task) -> Result<Outcome, IndexingError> {
        let now = Utc::now();
        let names: Vec<String> = batch.packages.iter().map(|p| p.name.clone()).collect();

        let counts = match self.downloads.downloads(&names).await {
            Ok(counts) => counts,
            Err(e) => {
                let retry_at = now + Duration::days(PERIODIC_RETRY_DAYS);
                for name in &names {
                    self.reschedule(name, retry_at).await?;
                }
                return Ok(Outcome::Retry(e.to_string()));
            }
        };

        let mut removed = 0;
        for package in &batch.packages {
            let downloads = counts.get(&package.name).copied().unwrap_or(0);

            if self.deletion_suspect(package, downloads, now) {
                match self.confirm_deleted(&package.name).await {
                    Ok(true) => {
                        removed += 1;
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(object_id = %package.name, error = %e, "Existence check failed");
                        self.reschedule(&package.name, now + Duration::days(PERIODIC_RETRY_DAYS))
                            .await?;
                        continue;
                    }
                }
            }

            self.refresh(&package.name, downloads, now).await?;
        }

        debug!(batch = batch.packages.len(), removed, "Periodic batch done");
        Ok(Outcome::Done)
    }

    async fn on_failure(&self, batch: &Self::Task, _error: &IndexingError) -> Result<(), IndexingError> {
        let retry_at = Utc::now() + Duration::days(PERIODIC_RETRY_DAYS);
        for package in &batch.packages {
            self.reschedule(&package.name, retry_at).await?;
        }
        Ok(())
    }
}
