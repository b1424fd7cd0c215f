//! HTTP collaborators for registry-mirror.
//!
//! - [`CouchRegistry`]: listing, change feed and documents of a
//!   CouchDB-compatible registry
//! - [`DownloadsClient`]: last-month download counts
//! - [`FilesClient`]: flat file listings of published versions
//!
//! Transient failures are retried with exponential backoff; status codes
//! are mapped onto [`mirror_types::RegistryError`] and
//! [`mirror_types::EnrichError`] so callers can apply their own policy.

pub mod enrich;
pub mod error;
pub mod http;
pub mod registry;

pub use enrich::{DownloadsClient, FilesClient};
pub use error::ClientError;
pub use http::{HttpClient, RetryPolicy};
pub use registry::CouchRegistry;
