//! Bootstrap orchestrator.
//!
//! Drives the one-time full traversal: prefetcher and bootstrap indexer run
//! until the listing is exhausted and the bookkeeping index is empty, then
//! the bootstrap index replaces production (after a dated backup of the
//! old production index). `run()` resolving with `Ok(true)` is the signal
//! that the watch phase may start.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mirror_indexing::{BootstrapStrategy, Indexer};
use mirror_storage::CheckpointStore;
use mirror_types::{CheckpointPatch, IndexSettings, PipelineSettings, Registry, SearchIndex};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::SyncError;
use crate::prefetcher::{PrefetchConfig, Prefetcher};

/// How often completion is checked once the listing is exhausted.
const FINISH_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub production: String,
    pub bootstrap: String,
    pub prefetch: PrefetchConfig,
    pub progress_interval: Duration,
}

impl BootstrapConfig {
    pub fn new(indices: &IndexSettings, pipeline: &PipelineSettings) -> Self {
        Self {
            production: indices.production.clone(),
            bootstrap: indices.bootstrap.clone(),
            prefetch: PrefetchConfig::from(pipeline),
            progress_interval: pipeline.progress_interval(),
        }
    }
}

/// Name of the production snapshot taken before it is replaced.
pub fn backup_name(production: &str, at: DateTime<Utc>) -> String {
    format!("{}.bak-{}", production, at.format("%Y-%m-%d"))
}

pub struct Bootstrap {
    checkpoint: Arc<CheckpointStore>,
    registry: Arc<dyn Registry>,
    index: Arc<dyn SearchIndex>,
    indexer: Indexer<BootstrapStrategy>,
    config: BootstrapConfig,
    prefetcher: Mutex<Option<Arc<Prefetcher>>>,
    done: AtomicBool,
    cancel: CancellationToken,
}

impl Bootstrap {
    pub fn new(
        checkpoint: Arc<CheckpointStore>,
        registry: Arc<dyn Registry>,
        index: Arc<dyn SearchIndex>,
        indexer: Indexer<BootstrapStrategy>,
        config: BootstrapConfig,
    ) -> Self {
        Self {
            checkpoint,
            registry,
            index,
            indexer,
            config,
            prefetcher: Mutex::new(None),
            done: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub fn indexer(&self) -> &Indexer<BootstrapStrategy> {
        &self.indexer
    }

    /// Run to completion. Returns `false` when stopped before finishing.
    pub async fn run(&self) -> Result<bool, SyncError> {
        let checkpoint = self.checkpoint.get().await?;
        if checkpoint.is_bootstrapped() {
            info!("Bootstrap already done, applying production settings");
            self.index.apply_settings(&self.config.production).await?;
            self.done.store(true, Ordering::SeqCst);
            return Ok(true);
        }

        if checkpoint.bootstrap_last_key.is_none() {
            let sequence = self.registry.current_sequence().await?;
            self.checkpoint.save(CheckpointPatch::sequence(sequence)).await?;
            self.index.apply_settings(&self.config.bootstrap).await?;
            info!(sequence, "Fresh bootstrap, watch will resume from this sequence");
        } else {
            info!(last_key = ?checkpoint.bootstrap_last_key, "Resuming bootstrap");
        }

        let prefetcher = Arc::new(Prefetcher::new(
            self.registry.clone(),
            self.checkpoint.clone(),
            self.indexer.clone(),
            self.config.prefetch.clone(),
            checkpoint.bootstrap_last_key.clone(),
        ));
        *self.prefetcher.lock().await = Some(prefetcher.clone());

        let indexer = self.indexer.clone();
        let indexer_handle = tokio::spawn(async move { indexer.run().await });

        let finished = self.traverse(&prefetcher).await;

        self.indexer.stop(false).await;
        match indexer_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Bootstrap indexer failed"),
            Err(e) => error!(error = %e, "Bootstrap indexer task failed"),
        }

        if !finished? {
            info!("Bootstrap stopped before completion");
            return Ok(false);
        }

        self.promote().await?;
        self.done.store(true, Ordering::SeqCst);
        info!("Bootstrap finished");
        Ok(true)
    }

    /// Prefetch the whole listing and wait for the indexer to finish it,
    /// logging progress along the way. `Ok(false)` when stopped.
    async fn traverse(&self, prefetcher: &Arc<Prefetcher>) -> Result<bool, SyncError> {
        let runner = prefetcher.clone();
        let mut prefetch = tokio::spawn(async move { runner.run().await });
        let mut prefetch_done = false;
        let mut progress = tokio::time::interval(self.config.progress_interval);
        progress.tick().await;

        loop {
            if prefetch_done && self.indexer.is_finished().await? {
                return Ok(true);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    prefetcher.stop();
                    if !prefetch_done {
                        (&mut prefetch).await??;
                    }
                    return Ok(false);
                }
                result = &mut prefetch, if !prefetch_done => {
                    result??;
                    prefetch_done = true;
                    info!(offset = prefetcher.offset(), "Listing fully prefetched, draining indexer");
                }
                _ = progress.tick() => self.log_progress(prefetcher).await,
                _ = tokio::time::sleep(FINISH_POLL), if prefetch_done => {}
            }
        }
    }

    async fn log_progress(&self, prefetcher: &Prefetcher) {
        let remaining = match self.indexer.remaining().await {
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, "Could not count bootstrap bookkeeping");
                return;
            }
        };
        let stats = self.indexer.stats();
        info!(
            offset = prefetcher.offset(),
            next_key = ?prefetcher.next_key().await,
            window = prefetcher.window_len().await,
            records = self.indexer.record_queue().size(),
            tasks = self.indexer.task_queue().size() + self.indexer.task_queue().pending(),
            remaining,
            done = stats.done,
            retried = stats.retried,
            not_found = stats.not_found,
            "Bootstrap progress"
        );
    }

    /// Back up production, replace it with the bootstrap index and mark the
    /// bootstrap done.
    async fn promote(&self) -> Result<(), SyncError> {
        let now = Utc::now();
        let production = &self.config.production;

        if self.index.count(production).await? > 0 {
            let backup = backup_name(production, now);
            let saved = self.index.copy_index(production, &backup).await?;
            info!(backup = %backup, records = saved, "Backed up production index");
        }

        let copied = self.index.copy_index(&self.config.bootstrap, production).await?;
        self.index.apply_settings(production).await?;
        info!(records = copied, production = %production, "Production index replaced");

        self.checkpoint
            .save(CheckpointPatch::bootstrap_finished(now))
            .await?;
        Ok(())
    }

    /// Stop prefetching and indexing; resolves once in-flight work is done.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(prefetcher) = self.prefetcher.lock().await.as_ref() {
            prefetcher.stop();
        }
        self.indexer.stop(false).await;
    }
}
