//! HTTP Metrics Source
//!
//! Implements MetricsSource with plain HTTP GET requests via reqwest.

use crate::domain::ports::{FetchError, MetricsSource};
use async_trait::async_trait;
use std::time::Duration;

/// Fetches metrics exposition bodies over HTTP(S).
///
/// No retries. Without a timeout a request waits as long as the
/// transport does.
#[derive(Clone)]
pub struct HttpMetricsSource {
    client: reqwest::Client,
}

impl HttpMetricsSource {
    /// Create a source using a default client with no request timeout.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Create a source whose requests give up after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Request(format!("client error: {}", e)))?;
        Ok(Self { client })
    }
}

impl Default for HttpMetricsSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricsSource for HttpMetricsSource {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(FetchError::Status(resp.status().as_u16()));
        }

        resp.text()
            .await
            .map_err(|e| FetchError::Request(format!("reading body: {}", e)))
    }
}
