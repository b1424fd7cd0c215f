//! # mirror-indexing
//!
//! Queue-based indexer engine for the registry mirror.
//!
//! An [`Indexer`] repeatedly scans one index for records whose facet matches
//! its strategy, turns them into tasks and runs them with bounded
//! concurrency. Four strategies are provided:
//!
//! - [`BootstrapStrategy`]: listing rows to bootstrap records
//! - [`WatchStrategy`]: changes parked after a failed inline application
//! - [`OneTimeStrategy`]: changelog and file-derived fields, once per version
//! - [`PeriodicStrategy`]: download counts, popularity and deleted packages

pub mod apply;
pub mod bookkeeping;
pub mod bootstrap;
pub mod engine;
pub mod error;
pub mod one_time;
pub mod periodic;
pub mod queue;
pub mod watch;

#[cfg(test)]
mod test_support;

pub use apply::{Applied, ChangeApplier, Prepared};
pub use bookkeeping::{Bookkeeping, TOO_MANY_RETRIES};
pub use bootstrap::BootstrapStrategy;
pub use engine::{IndexTask, Indexer, IndexerConfig, IndexerStats, IndexerStrategy, Outcome};
pub use error::IndexingError;
pub use one_time::{OneTimeStrategy, OneTimeTask, ONE_TIME_RETRY_DAYS};
pub use periodic::{
    PackageRef, PeriodicBatch, PeriodicConfig, PeriodicIndices, PeriodicStrategy,
    PERIODIC_RETRY_DAYS,
};
pub use queue::WorkQueue;
pub use watch::WatchStrategy;
