//! Poll-based change feed reader.
//!
//! The reader owns a cursor into the registry change feed. Each iteration
//! requests one bounded batch after the cursor and forwards it as events on
//! an mpsc channel: one [`ChangeEvent::Change`] per result in feed order,
//! then [`ChangeEvent::BatchComplete`]. The cursor only moves once a whole
//! batch has been fetched. An empty batch is the normal idle state and is
//! followed by a fixed poll interval; a failed call is reported as
//! [`ChangeEvent::Error`] and retried with capped exponential backoff.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use mirror_types::{Change, PipelineSettings, Registry, RegistryError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Event emitted by a [`ChangesReader`].
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Change(Change),
    /// Every change of the batch has been emitted
    BatchComplete { last_sequence: u64 },
    Error(RegistryError),
}

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl From<&PipelineSettings> for ReaderConfig {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            batch_size: settings.changes_batch_size,
            poll_interval: settings.poll_interval(),
            backoff_initial: Duration::from_millis(settings.backoff_initial_ms),
            backoff_max: Duration::from_millis(settings.backoff_max_ms),
        }
    }
}

pub struct ChangesReader {
    registry: Arc<dyn Registry>,
    cursor: AtomicU64,
    config: ReaderConfig,
    cancel: CancellationToken,
}

impl ChangesReader {
    pub fn new(registry: Arc<dyn Registry>, from_sequence: u64, config: ReaderConfig) -> Self {
        Self {
            registry,
            cursor: AtomicU64::new(from_sequence),
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Last sequence fully fetched.
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stop after the current iteration.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.backoff_initial,
            max_interval: self.config.backoff_max,
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Read until stopped or until the receiver is dropped.
    pub async fn run(&self, tx: mpsc::Sender<ChangeEvent>) {
        info!(since = self.cursor(), "Changes reader started");
        let mut backoff = self.backoff();

        while !self.cancel.is_cancelled() {
            let since = self.cursor();
            let batch = match self.registry.changes_since(since, self.config.batch_size).await {
                Ok(batch) => batch,
                Err(e) => {
                    let delay = backoff.next_backoff().unwrap_or(self.config.backoff_max);
                    warn!(since, error = %e, retry_in_ms = delay.as_millis(), "Change feed poll failed");
                    if tx.send(ChangeEvent::Error(e)).await.is_err() {
                        break;
                    }
                    self.pause(delay).await;
                    continue;
                }
            };
            backoff.reset();

            if batch.results.is_empty() {
                if batch.last_sequence > since {
                    self.cursor.store(batch.last_sequence, Ordering::SeqCst);
                }
                self.pause(self.config.poll_interval).await;
                continue;
            }

            let last_sequence = batch
                .results
                .iter()
                .map(|change| change.sequence)
                .fold(batch.last_sequence, u64::max);
            self.cursor.store(last_sequence, Ordering::SeqCst);
            debug!(since, last_sequence, changes = batch.results.len(), "Fetched changes");

            for change in batch.results {
                if tx.send(ChangeEvent::Change(change)).await.is_err() {
                    info!("Change consumer gone, reader exiting");
                    return;
                }
            }
            if tx
                .send(ChangeEvent::BatchComplete { last_sequence })
                .await
                .is_err()
            {
                break;
            }
        }
        info!(cursor = self.cursor(), "Changes reader stopped");
    }

    async fn pause(&self, delay: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
