//! Registry-side and index-side package types.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::IndexError;

/// Facet holding the retry counter of a bookkeeping entry.
pub const RETRIES_FACET: &str = "retries";

/// Facet holding when one-time data (changelog, file-derived fields) is due.
pub const ONE_TIME_FACET: &str = "_oneTimeDataToUpdateAt";

/// Facet holding when periodic data (downloads, popularity) is due.
pub const PERIODIC_FACET: &str = "_periodicDataUpdateAt";

/// Value of [`ONE_TIME_FACET`] once the one-time data has been computed.
pub const ONE_TIME_DONE: i64 = 0;

/// Width of one due-date facet bucket: one hour.
pub const DUE_BUCKET_MS: i64 = 60 * 60 * 1000;

/// Due-date facet value for `at`, floored to its bucket. Records scheduled
/// within the same hour share one facet value, so a discovery pass runs one
/// scan per bucket rather than one per record.
pub fn due_bucket(at: DateTime<Utc>) -> i64 {
    let ms = at.timestamp_millis();
    ms - ms.rem_euclid(DUE_BUCKET_MS)
}

/// One row of the full registry listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRow {
    pub id: String,
    pub revision: String,
}

/// One entry of the change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub id: String,
    pub sequence: u64,
    #[serde(default)]
    pub revisions: Vec<String>,
    #[serde(default)]
    pub deleted: bool,
}

impl Change {
    /// Revision to fetch; the feed lists the winning revision first.
    pub fn revision(&self) -> Option<&str> {
        self.revisions.first().map(String::as_str)
    }
}

/// A raw registry document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub rev: String,
    pub body: Value,
}

/// A unit of retryable work tracked in a bookkeeping index.
///
/// Stored as `{objectID, retries, payload}`; failed attempts bump
/// `retries` and leave the row for the next facet scan to pick up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem<P> {
    #[serde(rename = "objectID")]
    pub object_id: String,
    pub retries: u32,
    pub payload: P,
}

impl<P: Serialize + DeserializeOwned> WorkItem<P> {
    pub fn new(object_id: impl Into<String>, payload: P) -> Self {
        Self {
            object_id: object_id.into(),
            retries: 0,
            payload,
        }
    }

    pub fn to_record(&self) -> Result<Value, IndexError> {
        serde_json::to_value(self).map_err(IndexError::from)
    }

    pub fn from_record(record: &Value) -> Result<Self, IndexError> {
        serde_json::from_value(record.clone()).map_err(IndexError::from)
    }
}

/// Which part of the pipeline moved a package to the not-found ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MovedBy {
    Bootstrap,
    Watch,
    OneTimeIndexer,
    PeriodicIndexer,
}

/// Entry of the not-found ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotFoundEntry {
    #[serde(rename = "objectID")]
    pub object_id: String,
    pub error: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub date: DateTime<Utc>,
    pub moved_by: MovedBy,
}

impl NotFoundEntry {
    pub fn new(object_id: impl Into<String>, error: impl Into<String>, moved_by: MovedBy) -> Self {
        Self {
            object_id: object_id.into(),
            error: error.into(),
            date: Utc::now(),
            moved_by,
        }
    }

    pub fn to_record(&self) -> Result<Value, IndexError> {
        serde_json::to_value(self).map_err(IndexError::from)
    }
}

/// `objectID` of an index record.
pub fn object_id(record: &Value) -> Option<&str> {
    record.get("objectID").and_then(Value::as_str)
}

/// Facet value of `field` as the string the index groups by.
pub fn facet_value(record: &Value, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Scoped package names (`@scope/name`) cannot share a downloads batch.
pub fn is_scoped(name: &str) -> bool {
    name.starts_with('@')
}
