//! Watch orchestrator.
//!
//! Consumes the change feed one event at a time, in feed order, applying
//! each change straight to production and persisting its sequence before
//! the next one is looked at. A change that fails transiently is parked in
//! the watch bookkeeping index for the watch indexer and the feed moves on.

use std::sync::Arc;

use mirror_indexing::{Applied, Bookkeeping, ChangeApplier};
use mirror_storage::CheckpointStore;
use mirror_types::{Change, CheckpointPatch, ErrorReporter, Registry, Stage, WorkItem};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::changes::{ChangeEvent, ChangesReader, ReaderConfig};
use crate::error::SyncError;

/// Changes buffered between the reader and the consumer.
const EVENT_BUFFER: usize = 256;

pub struct Watch {
    checkpoint: Arc<CheckpointStore>,
    registry: Arc<dyn Registry>,
    applier: ChangeApplier,
    books: Bookkeeping,
    reporter: Arc<dyn ErrorReporter>,
    config: ReaderConfig,
    reader: Mutex<Option<Arc<ChangesReader>>>,
    cancel: CancellationToken,
}

impl Watch {
    pub fn new(
        checkpoint: Arc<CheckpointStore>,
        registry: Arc<dyn Registry>,
        applier: ChangeApplier,
        books: Bookkeeping,
        reporter: Arc<dyn ErrorReporter>,
        config: ReaderConfig,
    ) -> Self {
        Self {
            checkpoint,
            registry,
            applier,
            books,
            reporter,
            config,
            reader: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Follow the change feed until stopped. A checkpoint write failure
    /// ends the loop with an error; the failed sequence is not persisted.
    pub async fn run(&self) -> Result<(), SyncError> {
        let checkpoint = self.checkpoint.save(CheckpointPatch::stage(Stage::Watch)).await?;
        let since = checkpoint.sequence.unwrap_or(0);
        info!(since, "Watch started");

        let reader = Arc::new(ChangesReader::new(
            self.registry.clone(),
            since,
            self.config.clone(),
        ));
        *self.reader.lock().await = Some(reader.clone());

        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let runner = reader.clone();
        let reader_handle = tokio::spawn(async move { runner.run(tx).await });

        let result = loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                event = rx.recv() => event,
            };
            let Some(event) = event else {
                break Ok(());
            };
            if let Err(e) = self.handle(event).await {
                error!(error = %e, "Watch stopping");
                break Err(e);
            }
        };

        reader.stop();
        drop(rx);
        reader_handle.await?;
        info!(cursor = reader.cursor(), "Watch stopped");
        result
    }

    async fn handle(&self, event: ChangeEvent) -> Result<(), SyncError> {
        match event {
            ChangeEvent::Change(change) => {
                self.apply(&change).await?;
                self.checkpoint
                    .save(CheckpointPatch::sequence(change.sequence))
                    .await?;
            }
            ChangeEvent::BatchComplete { last_sequence } => {
                let checkpoint = self.checkpoint.get().await?;
                if checkpoint.sequence.map_or(true, |seq| seq < last_sequence) {
                    self.checkpoint
                        .save(CheckpointPatch::sequence(last_sequence))
                        .await?;
                }
                debug!(last_sequence, "Batch applied");
            }
            ChangeEvent::Error(e) => {
                warn!(error = %e, "Change feed unavailable");
            }
        }
        Ok(())
    }

    /// Apply one change inline; park it for the watch indexer when that
    /// fails. Only bookkeeping failures are returned. Writes and parking
    /// happen under the package lock shared with the watch indexer.
    async fn apply(&self, change: &Change) -> Result<(), SyncError> {
        let prepared = self.applier.prepare(change).await;
        let _guard = self.applier.lock(&change.id).await;
        let applied = match prepared {
            Ok(prepared) => self.applier.commit(change, prepared).await,
            Err(e) => Err(e),
        };
        match applied {
            Ok(Applied::NotFound(msg)) => {
                self.books.not_found(&change.id, &msg).await?;
                debug!(object_id = %change.id, seq = change.sequence, "Revision gone upstream");
            }
            Ok(applied) => {
                // A newer change supersedes anything parked for the package
                self.books.complete(&change.id).await?;
                debug!(object_id = %change.id, seq = change.sequence, outcome = ?applied, "Applied");
            }
            Err(e) => {
                if e.is_transient() {
                    warn!(object_id = %change.id, seq = change.sequence, error = %e, "Parking change");
                } else {
                    self.reporter
                        .report("watch", &change.id, 0, &e.to_string());
                }
                let mut item = WorkItem::new(change.id.clone(), change.clone());
                item.retries = 1;
                self.books.enqueue(&item).await?;
            }
        }
        Ok(())
    }

    /// Stop consuming after the event in progress.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(reader) = self.reader.lock().await.as_ref() {
            reader.stop();
        }
    }
}
