//! Scripted collaborators shared by the strategy tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use mirror_storage::{LocalIndex, Storage};
use mirror_types::{
    Change, ChangesBatch, Document, Downloads, EnrichError, ErrorReporter, FileListing, ListPage,
    ListingRow, PackageFile, Registry, RegistryError,
};
use serde_json::{json, Value};
use tempfile::TempDir;

pub fn local_index() -> (Arc<LocalIndex>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let storage = Arc::new(Storage::open(temp_dir.path()).unwrap());
    (Arc::new(LocalIndex::new(storage)), temp_dir)
}

/// Minimal registry document that formats into a record.
pub fn package_doc(name: &str, rev: &str, created: &str) -> Value {
    json!({
        "_id": name,
        "_rev": rev,
        "name": name,
        "dist-tags": {"latest": "1.0.0"},
        "versions": {"1.0.0": {"description": format!("{name} package")}},
        "time": {"created": created, "modified": created}
    })
}

#[derive(Default)]
pub struct MockRegistry {
    pub docs: DashMap<String, Value>,
    /// Ids whose next fetch fails with a transient error
    pub fail_once: DashSet<String>,
    pub fetches: AtomicUsize,
    pub sequence: AtomicU64,
}

impl MockRegistry {
    pub fn with_docs(names: &[&str]) -> Self {
        let registry = Self::default();
        for name in names {
            registry.add(name, "1-a");
        }
        registry
    }

    pub fn add(&self, name: &str, rev: &str) {
        self.docs
            .insert(name.to_string(), package_doc(name, rev, "2020-01-01T00:00:00.000Z"));
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Registry for MockRegistry {
    async fn list(&self, start_after: Option<&str>, limit: usize) -> Result<ListPage, RegistryError> {
        let mut ids: Vec<String> = self.docs.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        let rows = ids
            .into_iter()
            .filter(|id| start_after.map_or(true, |key| id.as_str() > key))
            .take(limit)
            .map(|id| ListingRow {
                revision: "1-a".to_string(),
                id,
            })
            .collect();
        Ok(ListPage { rows, offset: 0 })
    }

    async fn changes_since(&self, since: u64, _limit: usize) -> Result<ChangesBatch, RegistryError> {
        Ok(ChangesBatch {
            results: Vec::<Change>::new(),
            last_sequence: since,
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
        let body = self
            .docs
            .get(id)
            .map(|doc| doc.value().clone())
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        Ok(Document {
            id: id.to_string(),
            rev: body["_rev"].as_str().unwrap_or("1-a").to_string(),
            body,
        })
    }
}

#[derive(Default)]
pub struct MockDownloads {
    pub counts: HashMap<String, u64>,
    pub total: u64,
    pub fail: bool,
    pub calls: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl Downloads for MockDownloads {
    async fn downloads(&self, names: &[String]) -> Result<HashMap<String, u64>, EnrichError> {
        self.calls.lock().unwrap().push(names.to_vec());
        if self.fail {
            return Err(EnrichError::Source("downloads api down".into()));
        }
        Ok(names
            .iter()
            .filter_map(|n| self.counts.get(n).map(|c| (n.clone(), *c)))
            .collect())
    }

    async fn total(&self) -> Result<u64, EnrichError> {
        Ok(self.total)
    }
}

#[derive(Default)]
pub struct MockFiles {
    pub files: HashMap<String, Vec<PackageFile>>,
    pub fail: bool,
}

#[async_trait]
impl FileListing for MockFiles {
    async fn files(&self, name: &str, _version: &str) -> Result<Vec<PackageFile>, EnrichError> {
        if self.fail {
            return Err(EnrichError::Source("files api down".into()));
        }
        self.files
            .get(name)
            .cloned()
            .ok_or_else(|| EnrichError::Missing(name.to_string()))
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<(String, String, u32, String)>>,
}

impl RecordingReporter {
    pub fn reports(&self) -> Vec<(String, String, u32, String)> {
        self.reports.lock().unwrap().clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, source: &str, object_id: &str, retries: u32, error: &str) {
        self.reports.lock().unwrap().push((
            source.to_string(),
            object_id.to_string(),
            retries,
            error.to_string(),
        ));
    }
}
