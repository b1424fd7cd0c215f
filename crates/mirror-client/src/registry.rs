//! CouchDB-style registry client (`_all_docs`, `_changes`, documents).

use async_trait::async_trait;
use mirror_types::{
    Change, ChangesBatch, Document, ListPage, ListingRow, Registry, RegistryError, RegistrySettings,
};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::error::ClientError;
use crate::http::{join_segments, HttpClient, RetryPolicy};

pub struct CouchRegistry {
    http: HttpClient,
    base_url: String,
}

#[derive(Deserialize)]
struct AllDocsResponse {
    #[serde(default)]
    offset: u64,
    rows: Vec<AllDocsRow>,
}

#[derive(Deserialize)]
struct AllDocsRow {
    id: String,
    value: RowValue,
}

#[derive(Deserialize)]
struct RowValue {
    rev: String,
}

#[derive(Deserialize)]
struct ChangesResponse {
    results: Vec<ChangeRow>,
    last_seq: Value,
}

#[derive(Deserialize)]
struct ChangeRow {
    id: String,
    seq: Value,
    #[serde(default)]
    changes: Vec<RowValue>,
    #[serde(default)]
    deleted: bool,
}

#[derive(Deserialize)]
struct DbInfo {
    update_seq: Value,
}

/// Numeric prefix of a CouchDB sequence (`42` or `"42-g1AAAA..."`).
fn parse_seq(seq: &Value) -> Result<u64, RegistryError> {
    let parsed = match seq {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.split('-').next().and_then(|n| n.parse().ok()),
        _ => None,
    };
    parsed.ok_or_else(|| RegistryError::Fatal(format!("Unparseable sequence: {seq}")))
}

impl CouchRegistry {
    pub fn new(settings: &RegistrySettings) -> Result<Self, ClientError> {
        Self::with_retry(settings, RetryPolicy::default())
    }

    pub fn with_retry(settings: &RegistrySettings, retry: RetryPolicy) -> Result<Self, ClientError> {
        Ok(Self {
            http: HttpClient::new(Duration::from_secs(settings.timeout_secs), retry)?,
            base_url: settings.url.clone(),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ClientError> {
        join_segments(&self.base_url, segments)
    }
}

#[async_trait]
impl Registry for CouchRegistry {
    async fn list(&self, start_after: Option<&str>, limit: usize) -> Result<ListPage, RegistryError> {
        let mut url = self.url(&["_all_docs"])?;
        {
            let mut query = url.query_pairs_mut();
            // startkey is inclusive; over-fetch by one and drop the boundary row
            query.append_pair("limit", &(limit + usize::from(start_after.is_some())).to_string());
            if let Some(key) = start_after {
                query.append_pair("startkey", &Value::String(key.to_string()).to_string());
            }
        }

        let response: AllDocsResponse = self.http.get_json(url).await?;
        let rows: Vec<ListingRow> = response
            .rows
            .into_iter()
            .filter(|row| start_after.map_or(true, |key| row.id.as_str() > key))
            .take(limit)
            .map(|row| ListingRow {
                id: row.id,
                revision: row.value.rev,
            })
            .collect();

        debug!(start_after, rows = rows.len(), "Fetched listing page");
        Ok(ListPage {
            rows,
            offset: response.offset,
        })
    }

    async fn changes_since(&self, since: u64, limit: usize) -> Result<ChangesBatch, RegistryError> {
        let mut url = self.url(&["_changes"])?;
        url.query_pairs_mut()
            .append_pair("since", &since.to_string())
            .append_pair("limit", &limit.to_string());

        let response: ChangesResponse = self.http.get_json(url).await?;
        let mut results = Vec::with_capacity(response.results.len());
        for row in response.results {
            results.push(Change {
                sequence: parse_seq(&row.seq)?,
                id: row.id,
                revisions: row.changes.into_iter().map(|c| c.rev).collect(),
                deleted: row.deleted,
            });
        }
        Ok(ChangesBatch {
            last_sequence: parse_seq(&response.last_seq)?,
            results,
        })
    }

    async fn current_sequence(&self) -> Result<u64, RegistryError> {
        let info: DbInfo = self.http.get_json(self.url(&[])?).await?;
        parse_seq(&info.update_seq)
    }

    async fn get_document(&self, id: &str, revision: Option<&str>) -> Result<Document, RegistryError> {
        let mut url = self.url(&[id])?;
        if let Some(rev) = revision {
            url.query_pairs_mut().append_pair("rev", rev);
        }

        let body: Value = self.http.get_json(url).await?;
        let rev = body
            .get("_rev")
            .and_then(Value::as_str)
            .or(revision)
            .unwrap_or_default()
            .to_string();
        Ok(Document {
            id: id.to_string(),
            rev,
            body,
        })
    }
}
