//! Listing prefetcher for the bootstrap phase.
//!
//! Pages through the registry listing ahead of the bootstrap indexer. Each
//! page is first persisted as bookkeeping rows, so a restart never loses
//! listed work, and only then is the resume key advanced. Rows wait in a
//! bounded window until the indexer's record queue has room.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mirror_indexing::{BootstrapStrategy, Indexer};
use mirror_storage::CheckpointStore;
use mirror_types::{ListingRow, PipelineSettings, Registry, WorkItem};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SyncError;

#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    pub page_size: usize,
    /// Rows buffered ahead of the indexer
    pub window: usize,
    pub rate_limit_cooldown: Duration,
}

impl From<&PipelineSettings> for PrefetchConfig {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            page_size: settings.page_size,
            window: settings.prefetch_window,
            rate_limit_cooldown: settings.rate_limit_cooldown(),
        }
    }
}

pub struct Prefetcher {
    registry: Arc<dyn Registry>,
    checkpoint: Arc<CheckpointStore>,
    indexer: Indexer<BootstrapStrategy>,
    config: PrefetchConfig,
    window: Mutex<VecDeque<Value>>,
    next_key: Mutex<Option<String>>,
    offset: AtomicU64,
    finished: AtomicBool,
    cancel: CancellationToken,
}

impl Prefetcher {
    /// Start listing after `start_after`, or from the beginning.
    pub fn new(
        registry: Arc<dyn Registry>,
        checkpoint: Arc<CheckpointStore>,
        indexer: Indexer<BootstrapStrategy>,
        config: PrefetchConfig,
        start_after: Option<String>,
    ) -> Self {
        Self {
            registry,
            checkpoint,
            indexer,
            config,
            window: Mutex::new(VecDeque::new()),
            next_key: Mutex::new(start_after),
            offset: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Listing exhausted. Rows may still be waiting in the window.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Listing position, for progress reporting.
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }

    pub async fn next_key(&self) -> Option<String> {
        self.next_key.lock().await.clone()
    }

    pub async fn window_len(&self) -> usize {
        self.window.lock().await.len()
    }

    /// Stop fetching pages; a fetch in progress completes.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Fetch and hand over pages until the listing is exhausted and the
    /// window is empty, or until stopped.
    pub async fn run(&self) -> Result<(), SyncError> {
        info!(start_after = ?self.next_key().await, "Prefetcher started");

        while !self.cancel.is_cancelled() {
            self.feed().await;

            if self.is_finished() {
                if self.window_len().await == 0 {
                    break;
                }
                self.until_cancelled(self.indexer.wait_for_capacity()).await;
                continue;
            }

            if self.window_len().await >= self.config.window {
                self.until_cancelled(self.indexer.wait_for_capacity()).await;
                continue;
            }

            self.fetch_page().await?;
        }

        info!(offset = self.offset(), finished = self.is_finished(), "Prefetcher stopped");
        Ok(())
    }

    /// Fetch one page, persist it and buffer it.
    async fn fetch_page(&self) -> Result<(), SyncError> {
        let start_after = self.next_key().await;
        let page = match self
            .registry
            .list(start_after.as_deref(), self.config.page_size)
            .await
        {
            Ok(page) => page,
            Err(e) if e.is_retryable() => {
                warn!(
                    start_after = ?start_after,
                    error = %e,
                    cooldown_secs = self.config.rate_limit_cooldown.as_secs(),
                    "Listing throttled, cooling down"
                );
                self.until_cancelled(tokio::time::sleep(self.config.rate_limit_cooldown))
                    .await;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let Some(next_key) = page.next_key().map(str::to_string) else {
            info!(offset = self.offset(), "Listing exhausted");
            self.finished.store(true, Ordering::SeqCst);
            return Ok(());
        };

        let items: Vec<WorkItem<ListingRow>> = page
            .rows
            .iter()
            .map(|row| WorkItem::new(row.id.clone(), row.clone()))
            .collect();
        let records = self
            .indexer
            .strategy()
            .bookkeeping()
            .enqueue_many(&items)
            .await?;

        self.offset
            .store(page.offset + page.rows.len() as u64, Ordering::SeqCst);
        self.window.lock().await.extend(records);
        *self.next_key.lock().await = Some(next_key.clone());

        if !self.checkpoint.advance_last_key(&next_key).await? {
            debug!(next_key = %next_key, "Persisted key already ahead");
        }
        debug!(rows = page.rows.len(), next_key = %next_key, "Prefetched page");
        Ok(())
    }

    /// Move rows from the window to the record queue while it has room.
    async fn feed(&self) {
        let queue = self.indexer.record_queue();
        let mut window = self.window.lock().await;
        while queue.size() < queue.concurrency() {
            let Some(record) = window.pop_front() else {
                break;
            };
            self.indexer.push_record(record);
        }
    }

    async fn until_cancelled<F: std::future::Future>(&self, fut: F) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = fut => {}
        }
    }
}
