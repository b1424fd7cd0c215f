//! The search index the mirror writes to.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::IndexError;

/// One page of a facet scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanPage {
    pub hits: Vec<Value>,
    /// Pass back to continue; `None` once the facet value is exhausted
    pub cursor: Option<String>,
}

/// Hosted search index operations required by the pipeline.
///
/// Every record is a JSON object carrying a string `objectID`. All writes
/// are idempotent: deleting a missing record succeeds, upserting twice
/// leaves the same state.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Records of `index` whose `field` equals `value`, in `objectID` order.
    async fn scan_by_facet(
        &self,
        index: &str,
        field: &str,
        value: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ScanPage, IndexError>;

    /// Distinct values of `field` in `index`, sorted.
    async fn list_facet_values(&self, index: &str, field: &str) -> Result<Vec<String>, IndexError>;

    async fn get(&self, index: &str, object_id: &str) -> Result<Option<Value>, IndexError>;

    /// Replace the whole record.
    async fn upsert(&self, index: &str, record: Value) -> Result<(), IndexError>;

    async fn upsert_many(&self, index: &str, records: Vec<Value>) -> Result<(), IndexError> {
        for record in records {
            self.upsert(index, record).await?;
        }
        Ok(())
    }

    /// Merge top-level fields into an existing record.
    ///
    /// Missing records are created only when `create_if_not_exists` is set.
    async fn upsert_partial(
        &self,
        index: &str,
        record: Value,
        create_if_not_exists: bool,
    ) -> Result<(), IndexError>;

    async fn delete(&self, index: &str, object_id: &str) -> Result<(), IndexError>;

    /// Replace `dst` with a copy of `src`. Returns the number of records copied.
    async fn copy_index(&self, src: &str, dst: &str) -> Result<u64, IndexError>;

    async fn count(&self, index: &str) -> Result<u64, IndexError>;

    /// Push ranking/faceting settings for `index`.
    async fn apply_settings(&self, index: &str) -> Result<(), IndexError>;
}
