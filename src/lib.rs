//! rpc-balancer Library
//!
//! A byte-transparent connection forwarder that fronts an RPC server and
//! counts its active connections, plus a client-side finder that picks the
//! least-loaded forwarder from the metrics each one exposes.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use adapters::inbound::{
    ConnectionForwarder, ForwarderConfig, ForwarderError, ForwarderState, MetricsServer,
};
pub use adapters::outbound::{ConnectionGauge, EchoRpcServer, HttpMetricsSource};
pub use config::{load_config, ConfigError, EnvConfigLoader};
pub use domain::entities::{BestHost, HostDescriptor, MetricSample};
pub use domain::ports::{FetchError, MetricsSource, RpcServer};
pub use domain::services::{Comparator, MetricsBasedServerFinder};
pub use infrastructure::{ConnectionCounter, ShutdownController};
