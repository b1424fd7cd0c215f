//! End-to-end test infrastructure for registry-mirror.
//!
//! Provides a shared TestHarness, an in-memory registry whose listing,
//! change feed and documents can be scripted, and fake enrichment sources.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde_json::json;

use mirror_daemon::Collaborators;
use mirror_indexing::{
    Bookkeeping, BootstrapStrategy, ChangeApplier, Indexer, IndexerConfig,
};
use mirror_storage::{CheckpointStore, LocalIndex, Storage};
use mirror_sync::{Bootstrap, BootstrapConfig, ReaderConfig, Watch};
use mirror_types::{
    Change, ChangesBatch, Document, Downloads, EnrichError, FileListing, ListPage, ListingRow,
    MovedBy, PackageFile, Registry, RegistryError, Settings, TracingReporter,
};

/// Creation date given to packages added without one.
pub const DEFAULT_CREATED: &str = "2020-01-01T00:00:00.000Z";

/// Shared test harness for E2E tests.
pub struct TestHarness {
    /// Keeps temp dir alive for the lifetime of the harness
    pub _temp_dir: tempfile::TempDir,
    pub storage: Arc<Storage>,
    pub index: Arc<LocalIndex>,
    pub checkpoint: Arc<CheckpointStore>,
    /// Settings tuned for fast tests; index names are the defaults
    pub settings: Settings,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let storage =
            Arc::new(Storage::open(temp_dir.path()).expect("Failed to open test storage"));

        let mut settings = Settings::default();
        settings.db_path = temp_dir.path().to_string_lossy().to_string();
        settings.shutdown_timeout_secs = 10;
        let pipeline = &mut settings.pipeline;
        pipeline.page_size = 2;
        pipeline.prefetch_window = 10;
        pipeline.scan_page_size = 10;
        pipeline.record_concurrency = 4;
        pipeline.task_concurrency = 2;
        pipeline.facet_refresh_secs = 0;
        pipeline.min_pass_delay_secs = 1;
        pipeline.poll_interval_ms = 20;
        pipeline.backoff_initial_ms = 10;
        pipeline.backoff_max_ms = 50;
        pipeline.rate_limit_cooldown_secs = 0;
        pipeline.progress_interval_secs = 1;

        Self {
            index: Arc::new(LocalIndex::new(storage.clone())),
            checkpoint: Arc::new(CheckpointStore::new(storage.clone(), false)),
            storage,
            _temp_dir: temp_dir,
            settings,
        }
    }

    /// Indexer pacing for tests that build indexers directly.
    pub fn indexer_config(&self) -> IndexerConfig {
        IndexerConfig {
            min_pass_delay: Duration::from_millis(20),
            ..IndexerConfig::from(&self.settings.pipeline)
        }
    }

    pub fn bootstrap(&self, registry: Arc<FakeRegistry>) -> Bootstrap {
        let indices = &self.settings.indices;
        let books = Bookkeeping::new(
            self.index.clone(),
            &indices.bootstrap_queue,
            &indices.not_found,
            MovedBy::Bootstrap,
            self.settings.pipeline.max_retries,
        );
        let strategy =
            BootstrapStrategy::new(registry.clone(), self.index.clone(), books, &indices.bootstrap);
        let indexer = Indexer::new(
            strategy,
            self.index.clone(),
            Arc::new(TracingReporter),
            self.indexer_config(),
        );
        Bootstrap::new(
            self.checkpoint.clone(),
            registry,
            self.index.clone(),
            indexer,
            BootstrapConfig::new(indices, &self.settings.pipeline),
        )
    }

    pub fn watch_books(&self) -> Bookkeeping {
        let indices = &self.settings.indices;
        Bookkeeping::new(
            self.index.clone(),
            &indices.watch_queue,
            &indices.not_found,
            MovedBy::Watch,
            self.settings.pipeline.max_retries,
        )
    }

    pub fn applier(&self, registry: Arc<FakeRegistry>) -> ChangeApplier {
        let indices = &self.settings.indices;
        ChangeApplier::new(registry, self.index.clone(), &indices.production, &indices.data)
    }

    pub fn watch(&self, registry: Arc<FakeRegistry>) -> Watch {
        self.watch_with_applier(registry.clone(), self.applier(registry))
    }

    /// Watch sharing `applier`, and so its package locks, with an indexer.
    pub fn watch_with_applier(&self, registry: Arc<FakeRegistry>, applier: ChangeApplier) -> Watch {
        Watch::new(
            self.checkpoint.clone(),
            registry,
            applier,
            self.watch_books(),
            Arc::new(TracingReporter),
            ReaderConfig::from(&self.settings.pipeline),
        )
    }

    pub fn collaborators(
        &self,
        registry: Arc<FakeRegistry>,
        downloads: Arc<FakeDownloads>,
        files: Arc<FakeFiles>,
    ) -> Collaborators {
        Collaborators {
            registry,
            index: self.index.clone(),
            downloads,
            files,
            reporter: Arc::new(TracingReporter),
        }
    }

    pub fn production(&self) -> &str {
        &self.settings.indices.production
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll `check` every 10ms until it holds; panics after `timeout`.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(timeout, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[derive(Debug, Clone)]
struct FakePackage {
    revisions: Vec<String>,
    created: String,
    deleted: bool,
}

/// In-memory registry with a scripted change feed.
#[derive(Default)]
pub struct FakeRegistry {
    packages: DashMap<String, FakePackage>,
    changes: Mutex<Vec<Change>>,
    delays: DashMap<String, Duration>,
    fail_once: DashSet<String>,
    fetched: Mutex<Vec<(String, Option<String>)>>,
    list_calls: AtomicUsize,
    sequence: AtomicU64,
}

impl FakeRegistry {
    pub fn with_packages(names: &[&str]) -> Self {
        let registry = Self::default();
        for name in names {
            registry.add_package(name, DEFAULT_CREATED);
        }
        registry
    }

    pub fn add_package(&self, name: &str, created: &str) {
        self.packages.insert(
            name.to_string(),
            FakePackage {
                revisions: vec!["1-a".to_string()],
                created: created.to_string(),
                deleted: false,
            },
        );
    }

    /// Publish a new revision of `name` at feed position `sequence`.
    pub fn update(&self, name: &str, sequence: u64) -> String {
        let rev = format!("{sequence}-r");
        self.packages
            .entry(name.to_string())
            .or_insert_with(|| FakePackage {
                revisions: Vec::new(),
                created: DEFAULT_CREATED.to_string(),
                deleted: false,
            })
            .revisions
            .push(rev.clone());
        self.push_change(name, sequence, &rev, false);
        rev
    }

    /// Delete `name` at feed position `sequence`.
    pub fn delete(&self, name: &str, sequence: u64) {
        self.remove_silently(name);
        self.push_change(name, sequence, &format!("{sequence}-d"), true);
    }

    /// Delete `name` without a change feed entry.
    pub fn remove_silently(&self, name: &str) {
        if let Some(mut package) = self.packages.get_mut(name) {
            package.deleted = true;
        }
    }

    fn push_change(&self, name: &str, sequence: u64, rev: &str, deleted: bool) {
        self.changes.lock().unwrap().push(Change {
            id: name.to_string(),
            sequence,
            revisions: vec![rev.to_string()],
            deleted,
        });
        self.sequence.fetch_max(sequence, Ordering::SeqCst);
    }

    pub fn set_sequence(&self, sequence: u64) {
        self.sequence.store(sequence, Ordering::SeqCst);
    }

    /// Slow down fetches of one revision.
    pub fn delay_revision(&self, rev: &str, delay: Duration) {
        self.delays.insert(rev.to_string(), delay);
    }

    /// Fail the next fetch of `name` with a transient error.
    pub fn fail_once(&self, name: &str) {
        self.fail_once.insert(name.to_string());
    }

    /// Every document fetch as `(id, revision)`, in call order.
    pub fn fetched(&self) -> Vec<(String, Option<String>)> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn list_count(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Registry for FakeRegistry {
    async fn list(&self, start_after: Option<&str>, limit: usize) -> Result<ListPage, RegistryError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let mut live: Vec<(String, String)> = self
            .packages
            .iter()
            .filter(|p| !p.deleted)
            .filter_map(|p| {
                p.revisions
                    .last()
                    .map(|rev| (p.key().clone(), rev.clone()))
            })
            .collect();
        live.sort();

        let offset = live
            .iter()
            .take_while(|(id, _)| start_after.is_some_and(|key| id.as_str() <= key))
            .count() as u64;
        let rows = live
            .into_iter()
            .filter(|(id, _)| start_after.map_or(true, |key| id.as_str() > key))
            .take(limit)
            .map(|(id, revision)| ListingRow { id, revision })
            .collect();
        Ok(ListPage { rows, offset })
    }

    async fn changes_since(&self, since: u64, limit: usize) -> Result<ChangesBatch, RegistryError> {
        let results: Vec<Change> = self
            .changes
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.sequence > since)
            .take(limit)
            .cloned()
            .collect();
        let last_sequence = results.last().map_or(since, |c| c.sequence);
        Ok(ChangesBatch {
            results,
            last_sequence,
        })
    }

    async fn current_sequence(&self) -> Result<u64, RegistryError> {
        Ok(self.sequence.load(Ordering::SeqCst))
    }

    async fn get_document(&self, id: &str, revision: Option<&str>) -> Result<Document, RegistryError> {
        self.fetched
            .lock()
            .unwrap()
            .push((id.to_string(), revision.map(str::to_string)));

        if let Some(delay) = revision.and_then(|rev| self.delays.get(rev).map(|d| *d)) {
            tokio::time::sleep(delay).await;
        }
        if self.fail_once.remove(id).is_some() {
            return Err(RegistryError::Transient(format!("{id}: 503")));
        }

        let package = self
            .packages
            .get(id)
            .map(|p| p.clone())
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let rev = match revision {
            Some(rev) if package.revisions.iter().any(|r| r == rev) => rev.to_string(),
            Some(rev) => return Err(RegistryError::NotFound(format!("{id}@{rev}"))),
            None if package.deleted => return Err(RegistryError::NotFound(id.to_string())),
            None => package
                .revisions
                .last()
                .cloned()
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?,
        };

        Ok(Document {
            id: id.to_string(),
            rev: rev.clone(),
            body: json!({
                "_id": id,
                "_rev": rev,
                "name": id,
                "dist-tags": {"latest": "1.0.0"},
                "versions": {"1.0.0": {
                    "name": id,
                    "version": "1.0.0",
                    "description": format!("{id} at {rev}")
                }},
                "time": {"created": package.created, "modified": package.created}
            }),
        })
    }
}

/// Downloads source with fixed counts; unknown packages have none.
#[derive(Default)]
pub struct FakeDownloads {
    pub counts: DashMap<String, u64>,
    pub total: AtomicU64,
    calls: Mutex<Vec<Vec<String>>>,
}

impl FakeDownloads {
    pub fn with_total(total: u64) -> Self {
        let downloads = Self::default();
        downloads.total.store(total, Ordering::SeqCst);
        downloads
    }

    pub fn set(&self, name: &str, count: u64) {
        self.counts.insert(name.to_string(), count);
    }

    /// Names requested per call.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Downloads for FakeDownloads {
    async fn downloads(&self, names: &[String]) -> Result<HashMap<String, u64>, EnrichError> {
        self.calls.lock().unwrap().push(names.to_vec());
        Ok(names
            .iter()
            .filter_map(|name| self.counts.get(name).map(|c| (name.clone(), *c)))
            .collect())
    }

    async fn total(&self) -> Result<u64, EnrichError> {
        Ok(self.total.load(Ordering::SeqCst))
    }
}

/// File listings by package name; unknown packages have none published.
#[derive(Default)]
pub struct FakeFiles {
    pub files: DashMap<String, Vec<PackageFile>>,
}

impl FakeFiles {
    pub fn set(&self, name: &str, paths: &[&str]) {
        self.files.insert(
            name.to_string(),
            paths
                .iter()
                .map(|path| PackageFile {
                    name: path.to_string(),
                    size: 100,
                })
                .collect(),
        );
    }
}

#[async_trait]
impl FileListing for FakeFiles {
    async fn files(&self, name: &str, _version: &str) -> Result<Vec<PackageFile>, EnrichError> {
        self.files
            .get(name)
            .map(|files| files.clone())
            .ok_or_else(|| EnrichError::Missing(name.to_string()))
    }
}
