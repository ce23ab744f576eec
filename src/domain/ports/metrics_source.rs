//! Metrics Source Port
//!
//! Defines the interface for reading a metrics exposition document.

use async_trait::async_trait;

/// Error fetching a metrics document from one host.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected status: {0}")]
    Status(u16),
}

/// Source of plain-text metrics exposition bodies.
///
/// This is an outbound port; the finder only sees the response body.
/// The production adapter is `HttpMetricsSource`.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Fetch the body served at `url`. Non-2xx responses are errors.
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}
