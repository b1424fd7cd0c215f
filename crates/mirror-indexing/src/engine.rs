//! Generic two-stage indexer engine.
//!
//! An [`Indexer`] discovers work by paging through one facet of a search
//! index, hands every hit to a record queue (concurrency R) whose handler
//! turns hits into tasks, and runs tasks on a task queue (concurrency
//! T < R). What is scanned and what a task does is supplied by an
//! [`IndexerStrategy`].
//!
//! A pass scans every accepted facet value, waits for the record queue to
//! drain, flushes batched work, sleeps the minimum pass delay, waits for
//! the task queue to drain and starts over until stopped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use mirror_types::{object_id, ErrorReporter, PipelineSettings, SearchIndex, WorkItem};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::IndexingError;
use crate::queue::WorkQueue;

/// Result of one task execution that did not raise an unexpected error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Work applied; bookkeeping deleted or patched in place
    Done,
    /// Upstream no longer has the item; recorded in the not-found ledger
    NotFound(String),
    /// Transient failure; retry counter bumped, next scan picks it up
    Retry(String),
    /// Nothing usable to write; bookkeeping removed
    Dropped(String),
    /// Already handled by someone else
    Skipped,
}

/// A unit of work executed on the task queue.
pub trait IndexTask: Send + Sync + 'static {
    /// Index keys this task covers.
    fn object_ids(&self) -> Vec<&str>;

    /// Failed attempts so far.
    fn retries(&self) -> u32 {
        0
    }
}

impl<P: Send + Sync + 'static> IndexTask for WorkItem<P> {
    fn object_ids(&self) -> Vec<&str> {
        vec![self.object_id.as_str()]
    }

    fn retries(&self) -> u32 {
        self.retries
    }
}

/// What an indexer scans and what its tasks do.
#[async_trait]
pub trait IndexerStrategy: Send + Sync + 'static {
    type Task: IndexTask;

    /// Name for logs and error reports
    fn name(&self) -> &'static str;

    /// Index whose facet is scanned
    fn index_name(&self) -> &str;

    fn facet_field(&self) -> &'static str;

    /// Whether records with facet `value` are due for work at `now`.
    fn facet_filter(&self, value: &str, now: DateTime<Utc>) -> bool;

    /// Turn one discovered record into zero or more tasks.
    async fn on_record(&self, hit: Value) -> Result<Vec<Self::Task>, IndexingError>;

    /// Tasks held back for batching, released at the end of a pass.
    async fn flush(&self) -> Vec<Self::Task> {
        Vec::new()
    }

    /// Execute one task. Expected failures become an [`Outcome`]; an `Err`
    /// is reported and followed by [`IndexerStrategy::on_failure`].
    async fn execute(&self, task: &Self::Task) -> Result<Outcome, IndexingError>;

    /// Leave a failed task in a state the next scan will find.
    async fn on_failure(&self, task: &Self::Task, error: &IndexingError) -> Result<(), IndexingError>;

    /// Items still tracked in bookkeeping.
    async fn remaining(&self) -> Result<u64, IndexingError> {
        Ok(0)
    }
}

/// Queue sizes and pacing of one indexer.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub record_concurrency: usize,
    pub task_concurrency: usize,
    pub scan_page_size: usize,
    pub facet_refresh: Duration,
    pub min_pass_delay: Duration,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self::from(&PipelineSettings::default())
    }
}

impl From<&PipelineSettings> for IndexerConfig {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            record_concurrency: settings.record_concurrency,
            task_concurrency: settings.task_concurrency,
            scan_page_size: settings.scan_page_size,
            facet_refresh: settings.facet_refresh(),
            min_pass_delay: settings.min_pass_delay(),
        }
    }
}

/// Task outcome counters.
#[derive(Debug, Default)]
struct Counters {
    done: AtomicU64,
    not_found: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Done => &self.done,
            Outcome::NotFound(_) => &self.not_found,
            Outcome::Retry(_) => &self.retried,
            Outcome::Dropped(_) => &self.dropped,
            Outcome::Skipped => &self.skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of an indexer's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexerStats {
    pub done: u64,
    pub not_found: u64,
    pub retried: u64,
    pub dropped: u64,
    pub skipped: u64,
    pub failed: u64,
}

struct Shared<S: IndexerStrategy> {
    strategy: Arc<S>,
    index: Arc<dyn SearchIndex>,
    config: IndexerConfig,
    records: WorkQueue<Value>,
    tasks: WorkQueue<S::Task>,
    in_flight: Arc<DashSet<String>>,
    counters: Arc<Counters>,
    facet_cache: Mutex<Option<(Instant, Vec<String>)>>,
    cancel: CancellationToken,
}

/// Indexer engine parameterized by its strategy.
pub struct Indexer<S: IndexerStrategy> {
    shared: Arc<Shared<S>>,
}

impl<S: IndexerStrategy> Clone for Indexer<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S: IndexerStrategy> Indexer<S> {
    pub fn new(
        strategy: S,
        index: Arc<dyn SearchIndex>,
        reporter: Arc<dyn ErrorReporter>,
        config: IndexerConfig,
    ) -> Self {
        let strategy = Arc::new(strategy);
        let in_flight = Arc::new(DashSet::new());
        let counters = Arc::new(Counters::default());

        let tasks = {
            let strategy = strategy.clone();
            let in_flight = in_flight.clone();
            let counters = counters.clone();
            WorkQueue::new(
                format!("{}.tasks", strategy.name()),
                config.task_concurrency,
                move |task: S::Task| {
                    let strategy = strategy.clone();
                    let reporter = reporter.clone();
                    let in_flight = in_flight.clone();
                    let counters = counters.clone();
                    async move {
                        run_task(&*strategy, &*reporter, &counters, &task).await;
                        for id in task.object_ids() {
                            in_flight.remove(id);
                        }
                    }
                },
            )
        };

        let records = {
            let strategy = strategy.clone();
            let tasks = tasks.clone();
            let in_flight = in_flight.clone();
            WorkQueue::new(
                format!("{}.records", strategy.name()),
                config.record_concurrency,
                move |hit: Value| {
                    let strategy = strategy.clone();
                    let tasks = tasks.clone();
                    let in_flight = in_flight.clone();
                    async move { run_record(&*strategy, &tasks, &in_flight, hit).await }
                },
            )
        };

        Self {
            shared: Arc::new(Shared {
                strategy,
                index,
                config,
                records,
                tasks,
                in_flight,
                counters,
                facet_cache: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.shared.strategy.name()
    }

    pub fn strategy(&self) -> &S {
        &self.shared.strategy
    }

    /// Hand a discovered record to the record queue. Records whose
    /// `objectID` is already queued or running are skipped.
    pub fn push_record(&self, hit: Value) -> bool {
        let Some(id) = object_id(&hit) else {
            warn!(indexer = self.name(), "Discovered record without objectID");
            return false;
        };
        if !self.shared.in_flight.insert(id.to_string()) {
            debug!(indexer = self.name(), object_id = %id, "Already in flight");
            return false;
        }
        self.shared.records.push(hit);
        true
    }

    /// Put a task straight on the task queue.
    pub fn queue_task(&self, task: S::Task) {
        for id in task.object_ids() {
            self.shared.in_flight.insert(id.to_string());
        }
        self.shared.tasks.push(task);
    }

    /// Resolve once the record queue has room for another full wave.
    pub async fn wait_for_capacity(&self) {
        self.shared
            .records
            .wait_below(self.shared.config.record_concurrency)
            .await
    }

    /// Items waiting or running across both queues.
    pub fn backlog(&self) -> usize {
        let s = &self.shared;
        s.records.size() + s.records.pending() + s.tasks.size() + s.tasks.pending()
    }

    pub fn record_queue(&self) -> &WorkQueue<Value> {
        &self.shared.records
    }

    pub fn task_queue(&self) -> &WorkQueue<S::Task> {
        &self.shared.tasks
    }

    pub fn stats(&self) -> IndexerStats {
        let c = &self.shared.counters;
        IndexerStats {
            done: c.done.load(Ordering::Relaxed),
            not_found: c.not_found.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }

    pub async fn remaining(&self) -> Result<u64, IndexingError> {
        self.shared.strategy.remaining().await
    }

    /// Both queues drained and nothing left in bookkeeping.
    pub async fn is_finished(&self) -> Result<bool, IndexingError> {
        if !self.shared.records.is_idle() || !self.shared.tasks.is_idle() {
            return Ok(false);
        }
        Ok(self.remaining().await? == 0)
    }

    pub fn is_running(&self) -> bool {
        !self.shared.cancel.is_cancelled()
    }

    /// Resolve once both queues are idle.
    pub async fn drain(&self) {
        loop {
            self.shared.records.on_idle().await;
            self.shared.tasks.on_idle().await;
            if self.shared.records.is_idle() && self.shared.tasks.is_idle() {
                return;
            }
        }
    }

    /// Stop discovery, optionally drop queued work, and wait for running work.
    pub async fn stop(&self, force: bool) {
        self.shared.cancel.cancel();
        if force {
            let s = &self.shared;
            let records = s.records.clear();
            let tasks = s.tasks.clear();
            for id in records.iter().filter_map(object_id) {
                s.in_flight.remove(id);
            }
            for id in tasks.iter().flat_map(|task| task.object_ids()) {
                s.in_flight.remove(id);
            }
            let dropped = records.len() + tasks.len();
            if dropped > 0 {
                info!(indexer = self.name(), dropped, "Dropped queued work");
            }
        }
        self.drain().await;
        info!(indexer = self.name(), "Indexer stopped");
    }

    /// Run discovery passes until stopped.
    pub async fn run(&self) -> Result<(), IndexingError> {
        let s = &self.shared;
        info!(indexer = self.name(), index = %s.strategy.index_name(), "Indexer started");

        while !s.cancel.is_cancelled() {
            if let Err(e) = self.scan_pass().await {
                warn!(indexer = self.name(), error = %e, "Discovery pass failed");
            }

            if !self.until_cancelled(s.records.on_idle()).await {
                break;
            }
            for task in s.strategy.flush().await {
                self.queue_task(task);
            }

            if !self.until_cancelled(tokio::time::sleep(s.config.min_pass_delay)).await {
                break;
            }
            if !self.until_cancelled(self.drain()).await {
                break;
            }
        }
        Ok(())
    }

    /// Run `fut` unless the indexer is stopped first. Returns false on stop.
    async fn until_cancelled<F: std::future::Future>(&self, fut: F) -> bool {
        tokio::select! {
            _ = self.shared.cancel.cancelled() => false,
            _ = fut => true,
        }
    }

    /// One scan over every accepted facet value.
    async fn scan_pass(&self) -> Result<usize, IndexingError> {
        let s = &self.shared;
        let field = s.strategy.facet_field();
        let index_name = s.strategy.index_name();
        let now = Utc::now();
        let mut discovered = 0;

        for value in self.facet_values().await? {
            if !s.strategy.facet_filter(&value, now) {
                continue;
            }

            let mut cursor: Option<String> = None;
            loop {
                if s.cancel.is_cancelled() {
                    return Ok(discovered);
                }
                let page = s
                    .index
                    .scan_by_facet(index_name, field, &value, cursor.as_deref(), s.config.scan_page_size)
                    .await?;
                for hit in page.hits {
                    if self.push_record(hit) {
                        discovered += 1;
                    }
                }
                match page.cursor {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
                if !self.until_cancelled(self.wait_for_capacity()).await {
                    return Ok(discovered);
                }
            }

            if !self.until_cancelled(self.wait_for_capacity()).await {
                return Ok(discovered);
            }
        }

        if discovered > 0 {
            debug!(indexer = self.name(), discovered, "Scan pass complete");
        }
        Ok(discovered)
    }

    /// Facet values, re-enumerated at most once per `facet_refresh`.
    async fn facet_values(&self) -> Result<Vec<String>, IndexingError> {
        let s = &self.shared;
        let mut cache = s.facet_cache.lock().await;
        if let Some((fetched_at, values)) = cache.as_ref() {
            if fetched_at.elapsed() < s.config.facet_refresh {
                return Ok(values.clone());
            }
        }
        let values = s
            .index
            .list_facet_values(s.strategy.index_name(), s.strategy.facet_field())
            .await?;
        *cache = Some((Instant::now(), values.clone()));
        Ok(values)
    }
}

async fn run_record<S: IndexerStrategy>(
    strategy: &S,
    tasks: &WorkQueue<S::Task>,
    in_flight: &DashSet<String>,
    hit: Value,
) {
    let id = object_id(&hit).unwrap_or_default().to_string();
    match strategy.on_record(hit).await {
        Ok(new_tasks) => {
            let covered = new_tasks.iter().any(|t| t.object_ids().contains(&id.as_str()));
            for task in new_tasks {
                tasks.push(task);
            }
            if !covered {
                in_flight.remove(&id);
            }
        }
        Err(e) => {
            warn!(indexer = strategy.name(), object_id = %id, error = %e, "Could not admit record");
            in_flight.remove(&id);
        }
    }
}

async fn run_task<S: IndexerStrategy>(
    strategy: &S,
    reporter: &dyn ErrorReporter,
    counters: &Counters,
    task: &S::Task,
) {
    let ids = task.object_ids().join(",");
    match strategy.execute(task).await {
        Ok(outcome) => {
            match &outcome {
                Outcome::Retry(reason) => {
                    warn!(indexer = strategy.name(), object_id = %ids, retries = task.retries(), reason = %reason, "Task will be retried")
                }
                Outcome::NotFound(reason) => {
                    info!(indexer = strategy.name(), object_id = %ids, reason = %reason, "Moved to not-found")
                }
                other => debug!(indexer = strategy.name(), object_id = %ids, outcome = ?other, "Task finished"),
            }
            counters.record(&outcome);
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            reporter.report(strategy.name(), &ids, task.retries(), &e.to_string());
            if let Err(e) = strategy.on_failure(task, &e).await {
                warn!(indexer = strategy.name(), object_id = %ids, error = %e, "Could not record failure");
            }
        }
    }
}
