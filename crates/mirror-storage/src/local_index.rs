//! Search index backed by the local RocksDB records column family.
//!
//! Implements [`SearchIndex`] with the semantics the pipeline relies on:
//! cursor-paged facet scans in `objectID` order, sorted facet enumeration,
//! field-merging partial upserts and whole-index copies. Facet scans are
//! full scans of the index prefix, which is fine for bookkeeping indices
//! and acceptable for a single-node mirror.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use mirror_types::{
    facet_value, object_id, IndexError, ScanPage, SearchIndex, ONE_TIME_FACET, PERIODIC_FACET,
    RETRIES_FACET,
};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::db::Storage;
use crate::error::StorageError;

pub struct LocalIndex {
    storage: Arc<Storage>,
    /// Serializes read-modify-write of partial upserts
    write_lock: Mutex<()>,
}

impl LocalIndex {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            write_lock: Mutex::new(()),
        }
    }

    /// Settings last applied to `index`, if any.
    pub fn settings(&self, index: &str) -> Result<Option<Value>, StorageError> {
        match self.storage.get_index_meta(index)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn read(&self, index: &str, id: &str) -> Result<Option<Value>, StorageError> {
        match self.storage.get_record(index, id)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write(&self, index: &str, record: &Value) -> Result<(), IndexError> {
        let id = record_id(record)?;
        let bytes = serde_json::to_vec(record)?;
        self.storage.put_record(index, id, &bytes)?;
        Ok(())
    }
}

fn record_id(record: &Value) -> Result<&str, IndexError> {
    if !record.is_object() {
        return Err(IndexError::InvalidRecord("record is not an object".to_string()));
    }
    object_id(record).ok_or_else(|| IndexError::InvalidRecord("missing objectID".to_string()))
}

#[async_trait]
impl SearchIndex for LocalIndex {
    async fn scan_by_facet(
        &self,
        index: &str,
        field: &str,
        value: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ScanPage, IndexError> {
        let mut hits = Vec::new();
        let mut last_id: Option<String> = None;
        let mut more = false;

        self.storage.scan_records(index, cursor, |id, bytes| {
            let record: Value = serde_json::from_slice(bytes)?;
            if facet_value(&record, field).as_deref() != Some(value) {
                return Ok(true);
            }
            if hits.len() == limit {
                more = true;
                return Ok(false);
            }
            last_id = Some(id.to_string());
            hits.push(record);
            Ok(true)
        })?;

        Ok(ScanPage {
            hits,
            cursor: if more { last_id } else { None },
        })
    }

    async fn list_facet_values(&self, index: &str, field: &str) -> Result<Vec<String>, IndexError> {
        let mut values = BTreeSet::new();
        self.storage.scan_records(index, None, |_, bytes| {
            let record: Value = serde_json::from_slice(bytes)?;
            if let Some(value) = facet_value(&record, field) {
                values.insert(value);
            }
            Ok(true)
        })?;
        Ok(values.into_iter().collect())
    }

    async fn get(&self, index: &str, object_id: &str) -> Result<Option<Value>, IndexError> {
        Ok(self.read(index, object_id)?)
    }

    async fn upsert(&self, index: &str, record: Value) -> Result<(), IndexError> {
        let _guard = self.write_lock.lock().await;
        self.write(index, &record)
    }

    async fn upsert_many(&self, index: &str, records: Vec<Value>) -> Result<(), IndexError> {
        let mut batch = Vec::with_capacity(records.len());
        for record in &records {
            batch.push((record_id(record)?.to_string(), serde_json::to_vec(record)?));
        }
        let _guard = self.write_lock.lock().await;
        self.storage.put_records(index, &batch)?;
        Ok(())
    }

    async fn upsert_partial(
        &self,
        index: &str,
        record: Value,
        create_if_not_exists: bool,
    ) -> Result<(), IndexError> {
        let id = record_id(&record)?.to_string();
        let _guard = self.write_lock.lock().await;

        let merged = match self.read(index, &id)? {
            Some(mut existing) => {
                if let (Some(target), Value::Object(fields)) = (existing.as_object_mut(), record) {
                    target.extend(fields);
                }
                existing
            }
            None if create_if_not_exists => record,
            None => {
                debug!(index, object_id = %id, "Partial update skipped, record missing");
                return Ok(());
            }
        };
        self.write(index, &merged)
    }

    async fn delete(&self, index: &str, object_id: &str) -> Result<(), IndexError> {
        let _guard = self.write_lock.lock().await;
        self.storage.delete_record(index, object_id)?;
        Ok(())
    }

    async fn copy_index(&self, src: &str, dst: &str) -> Result<u64, IndexError> {
        let _guard = self.write_lock.lock().await;
        let copied = self.storage.copy_index(src, dst)?;
        if let Some(settings) = self.storage.get_index_meta(src)? {
            self.storage.put_index_meta(dst, &settings)?;
        }
        Ok(copied)
    }

    async fn count(&self, index: &str) -> Result<u64, IndexError> {
        Ok(self.storage.count_records(index)?)
    }

    async fn apply_settings(&self, index: &str) -> Result<(), IndexError> {
        let settings = json!({
            "attributesForFaceting": [RETRIES_FACET, ONE_TIME_FACET, PERIODIC_FACET],
            "searchableAttributes": ["name", "keywords", "description", "readme"],
            "appliedAt": Utc::now().timestamp_millis(),
        });
        self.storage
            .put_index_meta(index, &serde_json::to_vec(&settings)?)?;
        info!(index, "Applied index settings");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_index() -> (LocalIndex, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(temp_dir.path()).unwrap());
        (LocalIndex::new(storage), temp_dir)
    }

    async fn seed(index: &LocalIndex) {
        for (id, retries) in [("a", 0), ("b", 1), ("c", 0), ("d", 0), ("e", 2)] {
            index
                .upsert("q", json!({"objectID": id, "retries": retries}))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_scan_by_facet_pages_until_exhausted() {
        let (index, _temp) = create_index();
        seed(&index).await;

        let first = index.scan_by_facet("q", "retries", "0", None, 2).await.unwrap();
        let ids: Vec<_> = first.hits.iter().filter_map(object_id).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(first.cursor.as_deref(), Some("c"));

        let second = index
            .scan_by_facet("q", "retries", "0", first.cursor.as_deref(), 2)
            .await
            .unwrap();
        let ids: Vec<_> = second.hits.iter().filter_map(object_id).collect();
        assert_eq!(ids, vec!["d"]);
        assert!(second.cursor.is_none());
    }

    #[tokio::test]
    async fn test_list_facet_values_sorted() {
        let (index, _temp) = create_index();
        seed(&index).await;
        let values = index.list_facet_values("q", "retries").await.unwrap();
        assert_eq!(values, vec!["0", "1", "2"]);
        assert!(index.list_facet_values("empty", "retries").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_partial_merges_fields() {
        let (index, _temp) = create_index();
        index
            .upsert("p", json!({"objectID": "x", "name": "x", "version": "1.0.0"}))
            .await
            .unwrap();
        index
            .upsert_partial("p", json!({"objectID": "x", "version": "2.0.0"}), false)
            .await
            .unwrap();

        let record = index.get("p", "x").await.unwrap().unwrap();
        assert_eq!(record["name"], "x");
        assert_eq!(record["version"], "2.0.0");
    }

    #[tokio::test]
    async fn test_upsert_partial_respects_create_flag() {
        let (index, _temp) = create_index();
        index
            .upsert_partial("p", json!({"objectID": "y", "v": 1}), false)
            .await
            .unwrap();
        assert!(index.get("p", "y").await.unwrap().is_none());

        index
            .upsert_partial("p", json!({"objectID": "y", "v": 1}), true)
            .await
            .unwrap();
        assert!(index.get("p", "y").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalid_records_rejected() {
        let (index, _temp) = create_index();
        let err = index.upsert("p", json!({"name": "x"})).await.unwrap_err();
        assert!(matches!(err, IndexError::InvalidRecord(_)));
        let err = index.upsert("p", json!("x")).await.unwrap_err();
        assert!(matches!(err, IndexError::InvalidRecord(_)));
    }

    #[tokio::test]
    async fn test_copy_and_delete() {
        let (index, _temp) = create_index();
        seed(&index).await;
        index.apply_settings("q").await.unwrap();

        assert_eq!(index.copy_index("q", "q.copy").await.unwrap(), 5);
        assert_eq!(index.count("q.copy").await.unwrap(), 5);
        assert!(index.settings("q.copy").unwrap().is_some());

        index.delete("q.copy", "a").await.unwrap();
        index.delete("q.copy", "a").await.unwrap();
        assert_eq!(index.count("q.copy").await.unwrap(), 4);
        assert_eq!(index.count("q").await.unwrap(), 5);
    }
}
