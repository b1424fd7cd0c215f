//! Watch strategy: replay changes parked after a failed inline application.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mirror_types::{Change, WorkItem, RETRIES_FACET};
use serde_json::Value;
use tracing::debug;

use crate::apply::{Applied, ChangeApplier};
use crate::bookkeeping::Bookkeeping;
use crate::engine::{IndexerStrategy, Outcome};
use crate::error::IndexingError;

pub struct WatchStrategy {
    applier: ChangeApplier,
    books: Bookkeeping,
}

impl WatchStrategy {
    pub fn new(applier: ChangeApplier, books: Bookkeeping) -> Self {
        Self { applier, books }
    }

    /// Whether the parked row still holds this change.
    async fn is_current(&self, item: &WorkItem<Change>) -> Result<bool, IndexingError> {
        let parked: Option<WorkItem<Change>> = self.books.get(&item.object_id).await?;
        Ok(parked.is_some_and(|parked| parked.payload.sequence == item.payload.sequence))
    }
}

#[async_trait]
impl IndexerStrategy for WatchStrategy {
    type Task = WorkItem<Change>;

    fn name(&self) -> &'static str {
        "watch"
    }

    fn index_name(&self) -> &str {
        self.books.queue_name()
    }

    fn facet_field(&self) -> &'static str {
        RETRIES_FACET
    }

    fn facet_filter(&self, _value: &str, _now: DateTime<Utc>) -> bool {
        true
    }

    async fn on_record(&self, hit: Value) -> Result<Vec<Self::Task>, IndexingError> {
        Ok(self.books.admit(&hit).await?.into_iter().collect())
    }

    async fn execute(&self, item: &Self::Task) -> Result<Outcome, IndexingError> {
        // Cleared or replaced by a later inline application of the package
        if !self.is_current(item).await? {
            return Ok(Outcome::Skipped);
        }

        let prepared = self.applier.prepare(&item.payload).await;
        let _guard = self.applier.lock(&item.object_id).await;
        if !self.is_current(item).await? {
            debug!(object_id = %item.object_id, seq = item.payload.sequence, "Superseded");
            return Ok(Outcome::Skipped);
        }

        let applied = match prepared {
            Ok(prepared) => self.applier.commit(&item.payload, prepared).await,
            Err(e) => Err(e),
        };
        match applied {
            Ok(Applied::Deleted) | Ok(Applied::Upserted) => {
                self.books.complete(&item.object_id).await?;
                Ok(Outcome::Done)
            }
            Ok(Applied::Dropped) => {
                self.books.complete(&item.object_id).await?;
                Ok(Outcome::Dropped("no usable record".to_string()))
            }
            Ok(Applied::NotFound(msg)) => {
                self.books.not_found(&item.object_id, &msg).await?;
                Ok(Outcome::NotFound(msg))
            }
            Err(e) if e.is_transient() => {
                self.books.retry(item).await?;
                Ok(Outcome::Retry(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn on_failure(&self, item: &Self::Task, _error: &IndexingError) -> Result<(), IndexingError> {
        let _guard = self.applier.lock(&item.object_id).await;
        if self.is_current(item).await? {
            self.books.retry(item).await?;
        }
        Ok(())
    }

    async fn remaining(&self) -> Result<u64, IndexingError> {
        self.books.remaining().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{local_index, MockRegistry};
    use mirror_types::MovedBy;
    use std::sync::Arc;

    fn parked(id: &str, deleted: bool) -> WorkItem<Change> {
        parked_at(id, 7, deleted)
    }

    fn parked_at(id: &str, sequence: u64, deleted: bool) -> WorkItem<Change> {
        let mut item = WorkItem::new(
            id,
            Change {
                id: id.to_string(),
                sequence,
                revisions: vec!["2-b".to_string()],
                deleted,
            },
        );
        item.retries = 1;
        item
    }

    #[tokio::test]
    async fn test_parked_changes_are_applied() {
        let (index, _temp) = local_index();
        let registry = Arc::new(MockRegistry::with_docs(&["x"]));
        let applier = ChangeApplier::new(registry.clone(), index.clone(), "prod", "data");
        let books = Bookkeeping::new(index.clone(), "w.q", "w.nf", MovedBy::Watch, 5);
        let strategy = WatchStrategy::new(applier, books.clone());

        books.enqueue(&parked("x", false)).await.unwrap();
        assert_eq!(strategy.execute(&parked("x", false)).await.unwrap(), Outcome::Done);
        assert!(index.get("prod", "x").await.unwrap().is_some());
        assert_eq!(books.remaining().await.unwrap(), 0);

        books.enqueue(&parked("x", true)).await.unwrap();
        assert_eq!(strategy.execute(&parked("x", true)).await.unwrap(), Outcome::Done);
        assert!(index.get("prod", "x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transient_failure_bumps_retries() {
        let (index, _temp) = local_index();
        let registry = Arc::new(MockRegistry::with_docs(&["x"]));
        registry.fail_once.insert("x".to_string());
        let applier = ChangeApplier::new(registry, index.clone(), "prod", "data");
        let books = Bookkeeping::new(index.clone(), "w.q", "w.nf", MovedBy::Watch, 5);
        let strategy = WatchStrategy::new(applier, books.clone());

        books.enqueue(&parked("x", false)).await.unwrap();
        let outcome = strategy.execute(&parked("x", false)).await.unwrap();
        assert!(matches!(outcome, Outcome::Retry(_)));
        assert_eq!(index.get("w.q", "x").await.unwrap().unwrap()["retries"], 2);
    }

    #[tokio::test]
    async fn test_missing_revision_goes_to_not_found() {
        let (index, _temp) = local_index();
        let applier = ChangeApplier::new(Arc::new(MockRegistry::default()), index.clone(), "prod", "data");
        let books = Bookkeeping::new(index.clone(), "w.q", "w.nf", MovedBy::Watch, 5);
        let strategy = WatchStrategy::new(applier, books.clone());

        books.enqueue(&parked("ghost", false)).await.unwrap();
        let outcome = strategy.execute(&parked("ghost", false)).await.unwrap();
        assert!(matches!(outcome, Outcome::NotFound(_)));
        assert_eq!(index.get("w.nf", "ghost").await.unwrap().unwrap()["movedBy"], "watch");
    }

    #[tokio::test]
    async fn test_superseded_change_is_skipped() {
        let (index, _temp) = local_index();
        let registry = Arc::new(MockRegistry::with_docs(&["x"]));
        let applier = ChangeApplier::new(registry.clone(), index.clone(), "prod", "data");
        let books = Bookkeeping::new(index.clone(), "w.q", "w.nf", MovedBy::Watch, 5);
        let strategy = WatchStrategy::new(applier, books.clone());

        // A newer change for the package was parked over the one discovered
        books.enqueue(&parked_at("x", 9, true)).await.unwrap();
        let outcome = strategy.execute(&parked_at("x", 7, false)).await.unwrap();
        assert_eq!(outcome, Outcome::Skipped);
        assert!(index.get("prod", "x").await.unwrap().is_none());
        assert_eq!(registry.fetch_count(), 0);
        assert_eq!(books.remaining().await.unwrap(), 1);

        // Failure of the stale change leaves the newer row untouched
        let error = IndexingError::InvalidRecord("boom".to_string());
        strategy.on_failure(&parked_at("x", 7, false), &error).await.unwrap();
        assert_eq!(index.get("w.q", "x").await.unwrap().unwrap()["retries"], 1);
    }

    #[tokio::test]
    async fn test_change_superseded_during_fetch_is_not_written() {
        let (index, _temp) = local_index();
        let registry = Arc::new(MockRegistry::with_docs(&["x"]));
        let applier = ChangeApplier::new(registry, index.clone(), "prod", "data");
        let books = Bookkeeping::new(index.clone(), "w.q", "w.nf", MovedBy::Watch, 5);
        let strategy = WatchStrategy::new(applier.clone(), books.clone());

        books.enqueue(&parked_at("x", 7, false)).await.unwrap();
        // Inline application of a newer delete holds the package lock
        let guard = applier.lock("x").await;
        let pending = tokio::spawn(async move { strategy.execute(&parked_at("x", 7, false)).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        books.complete("x").await.unwrap();
        drop(guard);

        assert_eq!(pending.await.unwrap().unwrap(), Outcome::Skipped);
        assert!(index.get("prod", "x").await.unwrap().is_none());
    }
}
