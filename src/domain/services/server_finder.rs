//! Metrics-Based Server Finder
//!
//! Picks the forwarder with the best value of a named metric.
//! Only talks to hosts through the `MetricsSource` port.

use crate::domain::entities::{BestHost, HostDescriptor, MetricSample};
use crate::domain::ports::MetricsSource;
use std::sync::Arc;

/// Decides whether `candidate` beats `current_best`.
pub type Comparator = Arc<dyn Fn(f64, f64) -> bool + Send + Sync>;

/// A matching metric line whose value is not a number.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("metric {metric} has non-numeric value {value:?}")]
pub struct MetricParseError {
    pub metric: String,
    pub value: String,
}

/// Read `metric` from a plain-text exposition body.
///
/// Uses the first line that starts with `metric`; the first
/// whitespace-separated token after the name is the value.
/// Returns `Ok(None)` when no line matches.
pub fn parse_metric_value(body: &str, metric: &str) -> Result<Option<f64>, MetricParseError> {
    let Some(line) = body.lines().find(|line| line.starts_with(metric)) else {
        return Ok(None);
    };

    let token = line[metric.len()..]
        .split_whitespace()
        .next()
        .unwrap_or("");

    token
        .parse::<f64>()
        .map(Some)
        .map_err(|_| MetricParseError {
            metric: metric.to_string(),
            value: token.to_string(),
        })
}

/// Selects the best host among forwarders by a reported metric.
///
/// Each call to `fetch_metrics` performs one sequential scan over the
/// descriptors and keeps no state between calls, so one finder can be
/// shared between tasks.
pub struct MetricsBasedServerFinder {
    hosts: Vec<HostDescriptor>,
    metric_name: String,
    comparator: Comparator,
    source: Arc<dyn MetricsSource>,
}

impl MetricsBasedServerFinder {
    /// Create a finder preferring the lowest value.
    pub fn new(
        hosts: Vec<HostDescriptor>,
        metric_name: impl Into<String>,
        source: Arc<dyn MetricsSource>,
    ) -> Self {
        Self {
            hosts,
            metric_name: metric_name.into(),
            comparator: Arc::new(|candidate, best| candidate < best),
            source,
        }
    }

    /// Replace the comparator.
    ///
    /// It is called as `comparator(candidate, current_best)`; the candidate
    /// replaces the best only when it returns true, so ties keep the host
    /// that came first.
    pub fn with_comparator<F>(mut self, comparator: F) -> Self
    where
        F: Fn(f64, f64) -> bool + Send + Sync + 'static,
    {
        self.comparator = Arc::new(comparator);
        self
    }

    pub fn hosts(&self) -> &[HostDescriptor] {
        &self.hosts
    }

    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    /// Scan every host and return the one with the best metric value.
    ///
    /// Hosts that fail to answer, answer with a non-2xx status, or do not
    /// report a usable value are skipped with a warning. Returns `None` if
    /// no host produced a sample.
    pub async fn fetch_metrics(&self) -> Option<BestHost> {
        let mut best: Option<MetricSample> = None;

        for host in &self.hosts {
            let Some(sample) = self.sample(host).await else {
                continue;
            };

            match &best {
                Some(current) if !(self.comparator)(sample.value, current.value) => {}
                _ => best = Some(sample),
            }
        }

        match best {
            Some(sample) => {
                tracing::debug!(
                    "best host {}:{} ({}={})",
                    sample.host,
                    sample.port,
                    self.metric_name,
                    sample.value
                );
                Some(BestHost::new(sample.host, sample.port))
            }
            None => {
                tracing::warn!("no accessible servers or metric {} not found", self.metric_name);
                None
            }
        }
    }

    /// Fetch one host's metric value.
    async fn sample(&self, host: &HostDescriptor) -> Option<MetricSample> {
        let url = host.metrics_url();

        let body = match self.source.fetch(&url).await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("couldn't fetch metrics from {}, skipping: {}", url, e);
                return None;
            }
        };

        match parse_metric_value(&body, &self.metric_name) {
            Ok(Some(value)) => Some(MetricSample {
                host: host.host.clone(),
                port: host.port,
                value,
            }),
            Ok(None) => {
                tracing::warn!("metric {} not reported by {}, skipping", self.metric_name, url);
                None
            }
            Err(e) => {
                tracing::warn!("malformed metrics from {}, skipping: {}", url, e);
                None
            }
        }
    }
}
