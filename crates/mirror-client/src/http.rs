//! Shared JSON-over-HTTP plumbing with bounded retry.

use backoff::{backoff::Backoff, ExponentialBackoff};
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ClientError;

/// Retry policy for one logical request.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(500),
            max_elapsed: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    retry: RetryPolicy,
}

impl HttpClient {
    pub fn new(timeout: Duration, retry: RetryPolicy) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("registry-mirror/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;
        Ok(Self { client, retry })
    }

    /// GET `url` and decode the JSON body. Transient failures are retried
    /// with exponential backoff; anything else is returned at once.
    pub async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ClientError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.retry.initial_interval,
            max_elapsed_time: Some(self.retry.max_elapsed),
            ..Default::default()
        };
        let mut attempts = 0;

        loop {
            attempts += 1;
            debug!(attempt = attempts, url = %url, "GET");

            let err = match self.fetch(url.clone()).await {
                Ok(body) => return Ok(body),
                Err(e) => e,
            };
            if !err.is_transient() || attempts >= self.retry.max_attempts {
                return Err(err);
            }
            match backoff.next_backoff() {
                Some(duration) => {
                    warn!(
                        error = %err,
                        retry_in_ms = duration.as_millis(),
                        "Request failed, retrying"
                    );
                    tokio::time::sleep(duration).await;
                }
                None => return Err(err),
            }
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, url: Url) -> Result<T, ClientError> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.json::<T>().await?)
    }
}

/// `base` with `segments` appended as individually-escaped path segments.
pub fn join_segments(base: &str, segments: &[&str]) -> Result<Url, ClientError> {
    let mut url = Url::parse(base).map_err(|e| ClientError::Url(format!("{base}: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| ClientError::Url(format!("{base}: cannot be a base")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}
