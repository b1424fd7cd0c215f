//! Clients for the auxiliary enrichment sources.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use mirror_types::{Downloads, EnrichError, FileListing, PackageFile, RegistrySettings};
use serde::Deserialize;
use serde_json::Value;

use crate::error::ClientError;
use crate::http::{join_segments, HttpClient, RetryPolicy};

/// Downloads API (`/point/last-month[/names]`).
pub struct DownloadsClient {
    http: HttpClient,
    base_url: String,
}

#[derive(Deserialize)]
struct Point {
    downloads: u64,
}

impl DownloadsClient {
    pub fn new(settings: &RegistrySettings) -> Result<Self, ClientError> {
        Self::with_retry(settings, RetryPolicy::default())
    }

    pub fn with_retry(settings: &RegistrySettings, retry: RetryPolicy) -> Result<Self, ClientError> {
        Ok(Self {
            http: HttpClient::new(Duration::from_secs(settings.timeout_secs), retry)?,
            base_url: settings.downloads_url.clone(),
        })
    }
}

#[async_trait]
impl Downloads for DownloadsClient {
    async fn downloads(&self, names: &[String]) -> Result<HashMap<String, u64>, EnrichError> {
        let mut counts = HashMap::new();
        let joined = names.join(",");
        let url = join_segments(&self.base_url, &["point", "last-month", &joined])?;

        // A single package answers with a bare point, several with a map
        // of points where unknown names are null.
        if let [name] = names {
            match self.http.get_json::<Point>(url).await {
                Ok(point) => {
                    counts.insert(name.clone(), point.downloads);
                }
                Err(e) if e.status() == Some(404) => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(counts);
        }

        let body: HashMap<String, Option<Point>> = match self.http.get_json(url).await {
            Ok(body) => body,
            Err(e) if e.status() == Some(404) => return Ok(counts),
            Err(e) => return Err(e.into()),
        };
        for (name, point) in body {
            if let Some(point) = point {
                counts.insert(name, point.downloads);
            }
        }
        Ok(counts)
    }

    async fn total(&self) -> Result<u64, EnrichError> {
        let url = join_segments(&self.base_url, &["point", "last-month"])?;
        let point: Point = self.http.get_json(url).await?;
        Ok(point.downloads)
    }
}

/// Flat file listing of a published version.
pub struct FilesClient {
    http: HttpClient,
    base_url: String,
}

#[derive(Deserialize)]
struct FlatListing {
    files: Vec<Value>,
}

impl FilesClient {
    pub fn new(settings: &RegistrySettings) -> Result<Self, ClientError> {
        Self::with_retry(settings, RetryPolicy::default())
    }

    pub fn with_retry(settings: &RegistrySettings, retry: RetryPolicy) -> Result<Self, ClientError> {
        Ok(Self {
            http: HttpClient::new(Duration::from_secs(settings.timeout_secs), retry)?,
            base_url: settings.files_url.clone(),
        })
    }
}

#[async_trait]
impl FileListing for FilesClient {
    async fn files(&self, name: &str, version: &str) -> Result<Vec<PackageFile>, EnrichError> {
        let mut url = join_segments(&self.base_url, &[])?;
        // `@scope/name@version` stays unescaped on this API
        url.set_path(&format!("{}/{}@{}/flat", url.path().trim_end_matches('/'), name, version));

        let listing: FlatListing = self.http.get_json(url).await?;
        Ok(listing
            .files
            .into_iter()
            .filter_map(|file| serde_json::from_value(file).ok())
            .collect())
    }
}
