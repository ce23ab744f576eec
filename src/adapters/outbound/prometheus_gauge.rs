//! Prometheus Connection Gauge
//!
//! Holds the forwarder's connection count and renders it in Prometheus text
//! exposition format, the format `MetricsBasedServerFinder` reads back.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Gauge mirroring a `ConnectionCounter` through its change callback.
#[derive(Debug, Clone)]
pub struct ConnectionGauge {
    name: String,
    help: String,
    value: Arc<AtomicI64>,
}

impl ConnectionGauge {
    /// Create a gauge named `name`, starting at zero.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: "Number of connections forwarded".to_string(),
            value: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Set the help text shown in the exposition.
    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = help.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Export the gauge in Prometheus text format.
    pub fn render(&self) -> String {
        let mut output = String::new();
        output.push_str(&format!("# HELP {} {}\n", self.name, self.help));
        output.push_str(&format!("# TYPE {} gauge\n", self.name));
        output.push_str(&format!("{} {:.1}\n", self.name, self.get() as f64));
        output
    }
}
