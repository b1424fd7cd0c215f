//! Retry bookkeeping for queue-backed indexers.
//!
//! Work items live in a bookkeeping index as `{objectID, retries, payload}`.
//! Success deletes the row, a transient failure bumps `retries` in place so
//! the next facet scan finds it again, and a terminal failure moves it to
//! the not-found ledger.

use std::sync::Arc;

use mirror_types::{MovedBy, NotFoundEntry, SearchIndex, WorkItem, RETRIES_FACET};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::IndexingError;

/// Error recorded for items that failed too often.
pub const TOO_MANY_RETRIES: &str = "too many retries";

#[derive(Clone)]
pub struct Bookkeeping {
    index: Arc<dyn SearchIndex>,
    queue: String,
    not_found: String,
    moved_by: MovedBy,
    max_retries: u32,
}

impl Bookkeeping {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        queue: impl Into<String>,
        not_found: impl Into<String>,
        moved_by: MovedBy,
        max_retries: u32,
    ) -> Self {
        Self {
            index,
            queue: queue.into(),
            not_found: not_found.into(),
            moved_by,
            max_retries,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// Persist `item` and return the stored record.
    pub async fn enqueue<P>(&self, item: &WorkItem<P>) -> Result<Value, IndexingError>
    where
        P: Serialize + DeserializeOwned,
    {
        let record = item.to_record()?;
        self.index.upsert(&self.queue, record.clone()).await?;
        Ok(record)
    }

    /// Persist several items in one write.
    pub async fn enqueue_many<P>(&self, items: &[WorkItem<P>]) -> Result<Vec<Value>, IndexingError>
    where
        P: Serialize + DeserializeOwned,
    {
        let records = items
            .iter()
            .map(WorkItem::to_record)
            .collect::<Result<Vec<_>, _>>()?;
        self.index.upsert_many(&self.queue, records.clone()).await?;
        Ok(records)
    }

    /// Decode a discovered record. Items past the retry ceiling are moved
    /// to the not-found ledger and yield `None`.
    pub async fn admit<P>(&self, hit: &Value) -> Result<Option<WorkItem<P>>, IndexingError>
    where
        P: Serialize + DeserializeOwned,
    {
        let item: WorkItem<P> = WorkItem::from_record(hit)?;
        if item.retries > self.max_retries {
            warn!(
                queue = %self.queue,
                object_id = %item.object_id,
                retries = item.retries,
                "Giving up on item"
            );
            self.not_found(&item.object_id, TOO_MANY_RETRIES).await?;
            return Ok(None);
        }
        Ok(Some(item))
    }

    /// Whether the item is still tracked.
    pub async fn is_pending(&self, object_id: &str) -> Result<bool, IndexingError> {
        Ok(self.index.get(&self.queue, object_id).await?.is_some())
    }

    /// Read back a tracked item.
    pub async fn get<P>(&self, object_id: &str) -> Result<Option<WorkItem<P>>, IndexingError>
    where
        P: Serialize + DeserializeOwned,
    {
        match self.index.get(&self.queue, object_id).await? {
            Some(record) => Ok(Some(WorkItem::from_record(&record)?)),
            None => Ok(None),
        }
    }

    pub async fn complete(&self, object_id: &str) -> Result<(), IndexingError> {
        self.index.delete(&self.queue, object_id).await?;
        Ok(())
    }

    /// Record a terminal failure and stop tracking the item.
    pub async fn not_found(&self, object_id: &str, error: &str) -> Result<(), IndexingError> {
        let entry = NotFoundEntry::new(object_id, error, self.moved_by);
        self.index.upsert(&self.not_found, entry.to_record()?).await?;
        self.complete(object_id).await
    }

    /// Bump the retry counter of a tracked item; a completed item stays gone.
    pub async fn retry<P>(&self, item: &WorkItem<P>) -> Result<(), IndexingError> {
        debug!(queue = %self.queue, object_id = %item.object_id, retries = item.retries + 1, "Requeue");
        self.index
            .upsert_partial(
                &self.queue,
                json!({"objectID": item.object_id, RETRIES_FACET: item.retries + 1}),
                false,
            )
            .await?;
        Ok(())
    }

    pub async fn remaining(&self) -> Result<u64, IndexingError> {
        Ok(self.index.count(&self.queue).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::local_index;
    use mirror_types::ListingRow;

    fn bookkeeping(index: Arc<dyn SearchIndex>) -> Bookkeeping {
        Bookkeeping::new(index, "q", "nf", MovedBy::Bootstrap, 2)
    }

    fn row(id: &str) -> WorkItem<ListingRow> {
        WorkItem::new(
            id,
            ListingRow {
                id: id.to_string(),
                revision: "1-a".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_retry_then_complete() {
        let (index, _temp) = local_index();
        let books = bookkeeping(index.clone());

        books.enqueue(&row("a")).await.unwrap();
        books.retry(&row("a")).await.unwrap();
        let stored = index.get("q", "a").await.unwrap().unwrap();
        assert_eq!(stored["retries"], 1);
        assert_eq!(stored["payload"]["revision"], "1-a");

        books.complete("a").await.unwrap();
        assert!(!books.is_pending("a").await.unwrap());

        // A late retry must not resurrect a completed item
        books.retry(&row("a")).await.unwrap();
        assert_eq!(books.remaining().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_admit_moves_exhausted_items() {
        let (index, _temp) = local_index();
        let books = bookkeeping(index.clone());

        let mut item = row("stuck");
        item.retries = 3;
        let record = books.enqueue(&item).await.unwrap();

        let admitted: Option<WorkItem<ListingRow>> = books.admit(&record).await.unwrap();
        assert!(admitted.is_none());
        assert_eq!(books.remaining().await.unwrap(), 0);

        let entry = index.get("nf", "stuck").await.unwrap().unwrap();
        assert_eq!(entry["error"], TOO_MANY_RETRIES);
        assert_eq!(entry["movedBy"], "bootstrap");

        let fresh = books.enqueue(&row("ok")).await.unwrap();
        let admitted: Option<WorkItem<ListingRow>> = books.admit(&fresh).await.unwrap();
        assert_eq!(admitted.unwrap().object_id, "ok");
    }
}
