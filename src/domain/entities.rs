//! Domain Entities - Core business objects
//!
//! These entities describe where forwarders live and what they report.
//! They have no external dependencies and contain only business logic.

use serde::{Deserialize, Serialize};
use std::fmt;

fn default_scheme() -> String {
    "http".to_string()
}

/// Network location of one forwarder and of its metrics endpoint.
///
/// Descriptors are loaded once (see `EnvConfigLoader`) and never mutated.
/// Their order is significant: on equal metric values the earlier
/// descriptor wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDescriptor {
    /// Host name or IP the client dials
    pub host: String,
    /// Public forwarder port
    pub port: u16,
    /// Port of the metrics exposition endpoint
    pub metrics_port: u16,
    /// Path of the metrics endpoint, without the leading slash
    #[serde(default)]
    pub metrics_path: Option<String>,
    /// URL scheme of the metrics endpoint
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

impl HostDescriptor {
    /// Create a descriptor with no metrics path and the `http` scheme.
    pub fn new(host: impl Into<String>, port: u16, metrics_port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            metrics_port,
            metrics_path: None,
            scheme: default_scheme(),
        }
    }

    /// Set the metrics path.
    pub fn metrics_path(mut self, path: impl Into<String>) -> Self {
        self.metrics_path = Some(path.into());
        self
    }

    /// Set the URL scheme.
    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// URL of the metrics endpoint: `{scheme}://{host}:{metrics_port}/{metrics_path}`.
    ///
    /// A leading `/` on the configured path is dropped so it is not doubled.
    pub fn metrics_url(&self) -> String {
        let path = self
            .metrics_path
            .as_deref()
            .map(|p| p.trim_start_matches('/'))
            .unwrap_or("");
        format!(
            "{}://{}:{}/{}",
            self.scheme, self.host, self.metrics_port, path
        )
    }

    /// The `(host, port)` pair a client should dial.
    pub fn endpoint(&self) -> BestHost {
        BestHost {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

/// One metric value read from one host during a single scan.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub host: String,
    pub port: u16,
    pub value: f64,
}

/// The host selected by the finder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BestHost {
    pub host: String,
    pub port: u16,
}

impl BestHost {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for BestHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
