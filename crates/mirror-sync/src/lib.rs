//! # mirror-sync
//!
//! Moves registry state into the search index.
//!
//! - [`ChangesReader`]: poll-based change feed with capped backoff
//! - [`Prefetcher`]: resumable listing pager feeding the bootstrap indexer
//! - [`Bootstrap`]: one-time full traversal and production swap
//! - [`Watch`]: ordered, single-consumer application of the change feed

pub mod bootstrap;
pub mod changes;
pub mod error;
pub mod prefetcher;
pub mod watch;

#[cfg(test)]
mod test_support;

pub use bootstrap::{backup_name, Bootstrap, BootstrapConfig};
pub use changes::{ChangeEvent, ChangesReader, ReaderConfig};
pub use error::SyncError;
pub use prefetcher::{PrefetchConfig, Prefetcher};
pub use watch::Watch;
