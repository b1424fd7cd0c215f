//! The upstream registry as the pipeline sees it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::package::{Change, Document, ListingRow};

/// One page of the full registry listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListPage {
    pub rows: Vec<ListingRow>,
    /// Position of the first row in the whole listing
    pub offset: u64,
}

impl ListPage {
    /// Key to resume after this page.
    pub fn next_key(&self) -> Option<&str> {
        self.rows.last().map(|row| row.id.as_str())
    }
}

/// One poll of the change feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesBatch {
    pub results: Vec<Change>,
    pub last_sequence: u64,
}

/// Source of packages and changes.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Rows with keys strictly after `start_after`, in key order.
    async fn list(&self, start_after: Option<&str>, limit: usize)
        -> Result<ListPage, RegistryError>;

    /// Changes with a sequence strictly after `since`.
    async fn changes_since(&self, since: u64, limit: usize) -> Result<ChangesBatch, RegistryError>;

    /// Current head of the change feed.
    async fn current_sequence(&self) -> Result<u64, RegistryError>;

    /// Fetch a document, at `revision` when given, otherwise the latest.
    async fn get_document(&self, id: &str, revision: Option<&str>)
        -> Result<Document, RegistryError>;
}
