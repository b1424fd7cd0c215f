//! Bootstrap strategy: turn listing rows into records of the bootstrap index.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mirror_types::{format_document, ListingRow, Registry, RegistryError, SearchIndex, WorkItem, RETRIES_FACET};
use serde_json::Value;

use crate::bookkeeping::Bookkeeping;
use crate::engine::{IndexerStrategy, Outcome};
use crate::error::IndexingError;

pub struct BootstrapStrategy {
    registry: Arc<dyn Registry>,
    index: Arc<dyn SearchIndex>,
    books: Bookkeeping,
    target: String,
}

impl BootstrapStrategy {
    /// `books` tracks listing rows; records are written to `target`.
    pub fn new(
        registry: Arc<dyn Registry>,
        index: Arc<dyn SearchIndex>,
        books: Bookkeeping,
        target: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            index,
            books,
            target: target.into(),
        }
    }

    pub fn bookkeeping(&self) -> &Bookkeeping {
        &self.books
    }
}

#[async_trait]
impl IndexerStrategy for BootstrapStrategy {
    type Task = WorkItem<ListingRow>;

    fn name(&self) -> &'static str {
        "bootstrap"
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
        // A stale scan hit for a row another task already finished
        if !self.books.is_pending(&item.object_id).await? {
            return Ok(Outcome::Skipped);
        }

        let row = &item.payload;
        let doc = match self.registry.get_document(&row.id, Some(&row.revision)).await {
            Ok(doc) => doc,
            Err(RegistryError::NotFound(msg)) => {
                self.books.not_found(&item.object_id, &msg).await?;
                return Ok(Outcome::NotFound(msg));
            }
            Err(e) if e.is_retryable() => {
                self.books.retry(item).await?;
                return Ok(Outcome::Retry(e.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        match format_document(&doc, Utc::now()) {
            Some(record) => {
                self.index.upsert(&self.target, record).await?;
                self.books.complete(&item.object_id).await?;
                Ok(Outcome::Done)
            }
            None => {
                self.books.complete(&item.object_id).await?;
                Ok(Outcome::Dropped("no usable record".to_string()))
            }
        }
    }

    async fn on_failure(&self, item: &Self::Task, _error: &IndexingError) -> Result<(), IndexingError> {
        self.books.retry(item).await
    }

    async fn remaining(&self) -> Result<u64, IndexingError> {
        self.books.remaining().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Indexer, IndexerConfig};
    use crate::test_support::{local_index, MockRegistry, RecordingReporter};
    use mirror_types::MovedBy;
    use std::time::Duration;

    fn row(id: &str) -> WorkItem<ListingRow> {
        WorkItem::new(
            id,
            ListingRow {
                id: id.to_string(),
                revision: "1-a".to_string(),
            },
        )
    }

    fn config() -> IndexerConfig {
        IndexerConfig {
            record_concurrency: 8,
            task_concurrency: 4,
            scan_page_size: 10,
            facet_refresh: Duration::ZERO,
            min_pass_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_rows_become_records() {
        let (index, _temp) = local_index();
        let registry = Arc::new(MockRegistry::with_docs(&["a", "b"]));
        registry.fail_once.insert("b".to_string());
        let books = Bookkeeping::new(index.clone(), "boot.q", "boot.nf", MovedBy::Bootstrap, 5);
        let strategy = BootstrapStrategy::new(registry.clone(), index.clone(), books.clone(), "boot");

        for id in ["a", "b", "gone"] {
            books.enqueue(&row(id)).await.unwrap();
        }

        let indexer = Indexer::new(strategy, index.clone(), Arc::new(RecordingReporter::default()), config());
        let runner = indexer.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::timeout(Duration::from_secs(10), async {
            while !indexer.is_finished().await.unwrap() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        indexer.stop(false).await;
        handle.await.unwrap().unwrap();

        assert!(index.get("boot", "a").await.unwrap().is_some());
        assert!(index.get("boot", "b").await.unwrap().is_some());
        assert!(index.get("boot", "gone").await.unwrap().is_none());

        let entry = index.get("boot.nf", "gone").await.unwrap().unwrap();
        assert_eq!(entry["movedBy"], "bootstrap");

        let stats = indexer.stats();
        assert_eq!(stats.done, 2);
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.not_found, 1);
        // a, gone, b (failed) and b (retried)
        assert_eq!(registry.fetch_count(), 4);
    }

    #[tokio::test]
    async fn test_finished_row_is_skipped() {
        let (index, _temp) = local_index();
        let registry = Arc::new(MockRegistry::with_docs(&["a"]));
        let books = Bookkeeping::new(index.clone(), "boot.q", "boot.nf", MovedBy::Bootstrap, 5);
        let strategy = BootstrapStrategy::new(registry.clone(), index, books, "boot");

        assert_eq!(strategy.execute(&row("a")).await.unwrap(), Outcome::Skipped);
        assert_eq!(registry.fetch_count(), 0);
    }
}
