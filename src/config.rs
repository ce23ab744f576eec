use crate::adapters::outbound::HttpMetricsSource;
use crate::domain::entities::HostDescriptor;
use crate::domain::services::MetricsBasedServerFinder;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Settings of the `rpc-forwarder` binary.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,
    pub metrics_addr: String,
    pub metric_name: String,
    pub backlog: u32,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: "localhost".to_string(),
            listen_port: 50051,
            metrics_addr: "0.0.0.0:9100".to_string(),
            metric_name: "connections_num".to_string(),
            backlog: 8,
            debug: false,
        }
    }
}

pub fn load_config() -> anyhow::Result<Config> {
    let listen_host = std::env::var("RPC_FORWARDER_LISTEN_HOST")
        .unwrap_or_else(|_| "localhost".to_string());

    let listen_port = std::env::var("RPC_FORWARDER_LISTEN_PORT")
        .unwrap_or_else(|_| "50051".to_string())
        .parse()
        .unwrap_or(50051);

    let metrics_addr = std::env::var("RPC_FORWARDER_METRICS_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:9100".to_string());

    let metric_name = std::env::var("RPC_FORWARDER_METRIC_NAME")
        .unwrap_or_else(|_| "connections_num".to_string());

    let backlog = std::env::var("RPC_FORWARDER_BACKLOG")
        .unwrap_or_else(|_| "8".to_string())
        .parse()
        .unwrap_or(8);

    let debug = std::env::var("DEBUG").is_ok();

    Ok(Config {
        listen_host,
        listen_port,
        metrics_addr,
        metric_name,
        backlog,
        debug,
    })
}

/// Errors loading finder settings from the environment.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(String),
    #[error("{key} is not a valid {expected}: {value:?}")]
    Invalid {
        key: String,
        value: String,
        expected: &'static str,
    },
}

/// Loads host descriptors for `MetricsBasedServerFinder` from env vars.
///
/// With prefix `P`, host `i` (counting from 1) is described by
/// `P_HOST{i}_HOST`, `P_HOST{i}_PORT`, `P_HOST{i}_METRICS_PORT`, and the
/// optional `P_HOST{i}_METRICS_PATH` and `P_HOST{i}_SCHEME`. Loading stops
/// at the first index without a `_HOST` variable. The metric name comes
/// from `P_METRICS_NAME`.
#[derive(Debug, Clone)]
pub struct EnvConfigLoader {
    prefix: String,
}

impl Default for EnvConfigLoader {
    fn default() -> Self {
        Self::new("MB_SERVER_FINDER")
    }
}

impl EnvConfigLoader {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Load host descriptors from the process environment.
    pub fn load_hosts_config(&self) -> Result<Vec<HostDescriptor>, ConfigError> {
        self.load_hosts_config_from(|key| std::env::var(key).ok())
    }

    /// Load host descriptors through `lookup`.
    pub fn load_hosts_config_from<F>(&self, lookup: F) -> Result<Vec<HostDescriptor>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut hosts = Vec::new();

        for index in 1.. {
            let Some(host) = lookup(&self.host_key(index, "HOST")) else {
                break;
            };

            let port = self.required_port(&lookup, index, "PORT")?;
            let metrics_port = self.required_port(&lookup, index, "METRICS_PORT")?;
            let metrics_path = lookup(&self.host_key(index, "METRICS_PATH"));
            let scheme = lookup(&self.host_key(index, "SCHEME")).unwrap_or_else(|| "http".to_string());

            hosts.push(HostDescriptor {
                host,
                port,
                metrics_port,
                metrics_path,
                scheme,
            });
        }

        Ok(hosts)
    }

    /// Build a finder from the process environment.
    pub fn init_metrics_based_server_finder(&self) -> Result<MetricsBasedServerFinder, ConfigError> {
        self.init_metrics_based_server_finder_from(|key| std::env::var(key).ok())
    }

    /// Build a finder through `lookup`.
    ///
    /// `P_TIMEOUT_SECS` optionally bounds each metrics request.
    pub fn init_metrics_based_server_finder_from<F>(
        &self,
        lookup: F,
    ) -> Result<MetricsBasedServerFinder, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let hosts = self.load_hosts_config_from(&lookup)?;

        let name_key = format!("{}_METRICS_NAME", self.prefix);
        let metric_name = lookup(&name_key).ok_or_else(|| ConfigError::Missing(name_key.clone()))?;
        // A blank name would match every line of the exposition body.
        if metric_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: name_key,
                value: metric_name,
                expected: "metric name",
            });
        }
        let metric_name = metric_name.trim().to_string();

        let timeout_key = format!("{}_TIMEOUT_SECS", self.prefix);
        let source = match lookup(&timeout_key) {
            Some(value) => {
                let secs: u64 = value.parse().map_err(|_| ConfigError::Invalid {
                    key: timeout_key.clone(),
                    value: value.clone(),
                    expected: "number of seconds",
                })?;
                HttpMetricsSource::with_timeout(Duration::from_secs(secs)).map_err(|_| {
                    ConfigError::Invalid {
                        key: timeout_key,
                        value,
                        expected: "timeout",
                    }
                })?
            }
            None => HttpMetricsSource::new(),
        };

        Ok(MetricsBasedServerFinder::new(hosts, metric_name, Arc::new(source)))
    }

    fn host_key(&self, index: usize, suffix: &str) -> String {
        format!("{}_HOST{}_{}", self.prefix, index, suffix)
    }

    fn required_port<F>(&self, lookup: &F, index: usize, suffix: &str) -> Result<u16, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let key = self.host_key(index, suffix);
        let value = lookup(&key).ok_or_else(|| ConfigError::Missing(key.clone()))?;
        value.trim().parse().map_err(|_| ConfigError::Invalid {
            key,
            value,
            expected: "port",
        })
    }
}
