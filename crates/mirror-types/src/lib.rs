//! # mirror-types
//!
//! Shared domain types for the registry mirror.
//!
//! - [`Checkpoint`]: durable pipeline progress
//! - [`WorkItem`], [`ListingRow`], [`Change`], [`Document`], [`NotFoundEntry`]
//! - Collaborator traits: [`Registry`], [`SearchIndex`], [`Downloads`],
//!   [`FileListing`], [`ErrorReporter`]
//! - [`format_document`] and the enrichment derivations
//! - [`Settings`]: layered configuration

pub mod checkpoint;
pub mod config;
pub mod enrich;
pub mod error;
pub mod format;
pub mod index;
pub mod package;
pub mod registry;
pub mod report;

pub use checkpoint::{Checkpoint, CheckpointPatch, Stage};
pub use config::{IndexSettings, PipelineSettings, RegistrySettings, Settings};
pub use enrich::{
    changelog_filename, human_downloads, module_types, type_support, DownloadTotals, Downloads,
    FileListing, PackageFile,
};
pub use error::{EnrichError, IndexError, MirrorError, RegistryError};
pub use format::{enforce_size, format_document, MAX_RECORD_BYTES};
pub use index::{ScanPage, SearchIndex};
pub use package::{
    due_bucket, facet_value, is_scoped, object_id, Change, Document, ListingRow, MovedBy, NotFoundEntry,
    WorkItem, DUE_BUCKET_MS, ONE_TIME_DONE, ONE_TIME_FACET, PERIODIC_FACET, RETRIES_FACET,
};
pub use registry::{ChangesBatch, ListPage, Registry};
pub use report::{ErrorReporter, TracingReporter};
