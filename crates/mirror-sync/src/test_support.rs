//! Scripted registry and fixtures shared by the orchestrator tests.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use mirror_indexing::{BootstrapStrategy, Bookkeeping, Indexer, IndexerConfig};
use mirror_storage::{CheckpointStore, LocalIndex, Storage};
use mirror_types::{
    Change, ChangesBatch, Document, ListPage, ListingRow, MovedBy, Registry, RegistryError,
    TracingReporter,
};
use serde_json::json;
use tempfile::TempDir;

pub struct Fixture {
    pub index: Arc<LocalIndex>,
    pub checkpoint: Arc<CheckpointStore>,
    _temp: TempDir,
}

pub fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let storage = Arc::new(Storage::open(temp.path()).unwrap());
    Fixture {
        index: Arc::new(LocalIndex::new(storage.clone())),
        checkpoint: Arc::new(CheckpointStore::new(storage, false)),
        _temp: temp,
    }
}

pub fn indexer_config() -> IndexerConfig {
    IndexerConfig {
        record_concurrency: 4,
        task_concurrency: 2,
        scan_page_size: 10,
        facet_refresh: Duration::ZERO,
        min_pass_delay: Duration::from_millis(10),
    }
}

pub fn bootstrap_indexer(
    registry: Arc<ScriptedRegistry>,
    index: Arc<LocalIndex>,
) -> Indexer<BootstrapStrategy> {
    let books = Bookkeeping::new(index.clone(), "boot.q", "boot.nf", MovedBy::Bootstrap, 5);
    let strategy = BootstrapStrategy::new(registry, index.clone(), books, "boot");
    Indexer::new(strategy, index, Arc::new(TracingReporter), indexer_config())
}

#[derive(Default)]
pub struct ScriptedRegistry {
    pub docs: DashMap<String, String>,
    pub changes: Mutex<Vec<Change>>,
    pub sequence: AtomicU64,
    pub list_calls: AtomicUsize,
    pub fetches: AtomicUsize,
    /// Ids whose next fetch fails with a transient error
    pub fail_once: DashSet<String>,
    failing_changes: AtomicUsize,
    rate_limited_lists: AtomicUsize,
}

impl ScriptedRegistry {
    pub fn with_docs(names: &[&str]) -> Self {
        let registry = Self::default();
        for name in names {
            registry.docs.insert(name.to_string(), "1-a".to_string());
        }
        registry
    }

    pub fn push_change(&self, id: &str, sequence: u64, deleted: bool) {
        let rev = format!("{sequence}-r");
        if !deleted {
            self.docs.insert(id.to_string(), rev.clone());
        }
        self.changes.lock().unwrap().push(Change {
            id: id.to_string(),
            sequence,
            revisions: vec![rev],
            deleted,
        });
    }

    /// Fail the next `n` change feed polls.
    pub fn fail_changes(&self, n: usize) {
        self.failing_changes.store(n, Ordering::SeqCst);
    }

    /// Answer the next `n` listing calls with a rate-limit error.
    pub fn rate_limit_lists(&self, n: usize) {
        self.rate_limited_lists.store(n, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn list_count(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Registry for ScriptedRegistry {
    async fn list(&self, start_after: Option<&str>, limit: usize) -> Result<ListPage, RegistryError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.rate_limited_lists) {
            return Err(RegistryError::RateLimited("429".to_string()));
        }
        let mut ids: Vec<(String, String)> = self
            .docs
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        ids.sort();
        let offset = ids
            .iter()
            .filter(|(id, _)| start_after.is_some_and(|key| id.as_str() <= key))
            .count() as u64;
        let rows = ids
            .into_iter()
            .filter(|(id, _)| start_after.map_or(true, |key| id.as_str() > key))
            .take(limit)
            .map(|(id, revision)| ListingRow { id, revision })
            .collect();
        Ok(ListPage { rows, offset })
    }

    async fn changes_since(&self, since: u64, limit: usize) -> Result<ChangesBatch, RegistryError> {
        if take_one(&self.failing_changes) {
            return Err(RegistryError::Transient("feed unavailable".to_string()));
        }
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

    async fn get_document(&self, id: &str, _revision: Option<&str>) -> Result<Document, RegistryError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_once.remove(id).is_some() {
            return Err(RegistryError::Transient(format!("{id}: 503")));
        }
        let rev = self
            .docs
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        Ok(Document {
            id: id.to_string(),
            rev: rev.clone(),
            body: json!({
                "_id": id,
                "_rev": rev,
                "name": id,
                "dist-tags": {"latest": "1.0.0"},
                "versions": {"1.0.0": {"description": format!("{id} at {rev}")}},
                "time": {"created": "2020-01-01T00:00:00.000Z", "modified": "2020-01-01T00:00:00.000Z"}
            }),
        })
    }
}
