//! Wiring and supervision of the pipeline components.
//!
//! The background indexers run for the whole process lifetime. Bootstrap
//! runs first and, once it reports completion, watch takes over. A
//! shutdown request stops every component and waits for in-flight work,
//! bounded by the configured grace period.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mirror_indexing::{
    Bookkeeping, BootstrapStrategy, ChangeApplier, Indexer, IndexerConfig, IndexingError,
    OneTimeStrategy, PeriodicConfig, PeriodicIndices, PeriodicStrategy, WatchStrategy,
};
use mirror_storage::{CheckpointStore, Storage};
use mirror_sync::{Bootstrap, BootstrapConfig, ReaderConfig, SyncError, Watch};
use mirror_types::{
    DownloadTotals, Downloads, ErrorReporter, FileListing, MovedBy, Registry, SearchIndex,
    Settings,
};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// External services the pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub registry: Arc<dyn Registry>,
    pub index: Arc<dyn SearchIndex>,
    pub downloads: Arc<dyn Downloads>,
    pub files: Arc<dyn FileListing>,
    pub reporter: Arc<dyn ErrorReporter>,
}

/// How a supervised run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Every component stopped within the grace period
    Graceful,
    /// Components were still busy when the grace period ran out
    TimedOut,
}

pub struct Pipeline {
    checkpoint: Arc<CheckpointStore>,
    totals: Arc<DownloadTotals>,
    downloads: Arc<dyn Downloads>,
    bootstrap: Arc<Bootstrap>,
    watch: Arc<Watch>,
    watch_indexer: Indexer<WatchStrategy>,
    one_time: Indexer<OneTimeStrategy>,
    periodic: Indexer<PeriodicStrategy>,
    grace: Duration,
}

impl Pipeline {
    pub fn new(settings: &Settings, storage: Arc<Storage>, c: Collaborators) -> Self {
        let indices = &settings.indices;
        let pipeline = &settings.pipeline;
        let config = IndexerConfig::from(pipeline);
        let checkpoint = Arc::new(CheckpointStore::new(storage, pipeline.seed));
        let totals = Arc::new(DownloadTotals::new());

        let bootstrap_books = Bookkeeping::new(
            c.index.clone(),
            &indices.bootstrap_queue,
            &indices.not_found,
            MovedBy::Bootstrap,
            pipeline.max_retries,
        );
        let bootstrap_indexer = Indexer::new(
            BootstrapStrategy::new(
                c.registry.clone(),
                c.index.clone(),
                bootstrap_books,
                &indices.bootstrap,
            ),
            c.index.clone(),
            c.reporter.clone(),
            config.clone(),
        );
        let bootstrap = Arc::new(Bootstrap::new(
            checkpoint.clone(),
            c.registry.clone(),
            c.index.clone(),
            bootstrap_indexer,
            BootstrapConfig::new(indices, pipeline),
        ));

        let applier = ChangeApplier::new(
            c.registry.clone(),
            c.index.clone(),
            &indices.production,
            &indices.data,
        );
        let watch_books = Bookkeeping::new(
            c.index.clone(),
            &indices.watch_queue,
            &indices.not_found,
            MovedBy::Watch,
            pipeline.max_retries,
        );
        let watch = Arc::new(Watch::new(
            checkpoint.clone(),
            c.registry.clone(),
            applier.clone(),
            watch_books.clone(),
            c.reporter.clone(),
            ReaderConfig::from(pipeline),
        ));
        let watch_indexer = Indexer::new(
            WatchStrategy::new(applier, watch_books),
            c.index.clone(),
            c.reporter.clone(),
            config.clone(),
        );

        let one_time = Indexer::new(
            OneTimeStrategy::new(c.index.clone(), c.files.clone(), &indices.production),
            c.index.clone(),
            c.reporter.clone(),
            config.clone(),
        );

        let periodic = Indexer::new(
            PeriodicStrategy::new(
                c.registry.clone(),
                c.index.clone(),
                c.downloads.clone(),
                totals.clone(),
                PeriodicIndices {
                    production: indices.production.clone(),
                    data: indices.data.clone(),
                    not_found: indices.not_found.clone(),
                },
                PeriodicConfig {
                    batch_size: pipeline.periodic_batch_size,
                    refresh: pipeline.periodic_refresh(),
                    deleted_check_min_age: pipeline.deleted_check_min_age(),
                },
            ),
            c.index.clone(),
            c.reporter.clone(),
            config,
        );

        Self {
            checkpoint,
            totals,
            downloads: c.downloads,
            bootstrap,
            watch,
            watch_indexer,
            one_time,
            periodic,
            grace: Duration::from_secs(settings.shutdown_timeout_secs),
        }
    }

    pub fn checkpoint(&self) -> &Arc<CheckpointStore> {
        &self.checkpoint
    }

    pub fn bootstrap(&self) -> &Arc<Bootstrap> {
        &self.bootstrap
    }

    /// Run until `shutdown` resolves or the bootstrap/watch phase fails.
    pub async fn run<F>(&self, shutdown: F) -> Result<Exit>
    where
        F: Future<Output = ()>,
    {
        let checkpoint = self
            .checkpoint
            .check()
            .await
            .context("Failed to read checkpoint")?;
        info!(
            sequence = ?checkpoint.sequence,
            bootstrap_done = checkpoint.bootstrap_done,
            last_key = ?checkpoint.bootstrap_last_key,
            stage = ?checkpoint.stage,
            "Pipeline starting"
        );

        if let Err(e) = self.totals.load(&*self.downloads).await {
            warn!(error = %e, "Download total unavailable, popularity ratios stay at zero");
        }

        let background = vec![
            spawn_indexer(self.one_time.clone()),
            spawn_indexer(self.periodic.clone()),
            spawn_indexer(self.watch_indexer.clone()),
        ];

        let bootstrap = self.bootstrap.clone();
        let watch = self.watch.clone();
        let mut phases: JoinHandle<Result<(), SyncError>> = tokio::spawn(async move {
            if bootstrap.run().await? {
                info!("Bootstrap complete, starting watch");
                watch.run().await?;
            }
            Ok(())
        });

        tokio::pin!(shutdown);
        let failure = tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                None
            }
            result = &mut phases => match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(anyhow::Error::new(e).context("Pipeline phase failed")),
                Err(e) => Some(anyhow::Error::new(e).context("Pipeline phase panicked")),
            },
        };

        let stopped = tokio::time::timeout(self.grace, async {
            self.stop().await;
            if !phases.is_finished() {
                if let Ok(Err(e)) = (&mut phases).await {
                    error!(error = %e, "Pipeline phase failed during shutdown");
                }
            }
            for handle in background {
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(error = %e, "Indexer failed"),
                    Err(e) => error!(error = %e, "Indexer task panicked"),
                }
            }
        })
        .await;

        if let Some(e) = failure {
            return Err(e);
        }
        match stopped {
            Ok(()) => {
                info!("Pipeline stopped");
                Ok(Exit::Graceful)
            }
            Err(_) => {
                warn!(grace_secs = self.grace.as_secs(), "Graceful shutdown timed out");
                Ok(Exit::TimedOut)
            }
        }
    }

    /// Ask every component to stop and wait for in-flight work.
    pub async fn stop(&self) {
        tokio::join!(
            self.bootstrap.stop(),
            self.watch.stop(),
            self.watch_indexer.stop(false),
            self.one_time.stop(false),
            self.periodic.stop(false),
        );
    }
}

fn spawn_indexer<S>(indexer: Indexer<S>) -> JoinHandle<Result<(), IndexingError>>
where
    S: mirror_indexing::IndexerStrategy,
{
    tokio::spawn(async move { indexer.run().await })
}
