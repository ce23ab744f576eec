mod echo_rpc_server;
mod http_metrics_source;
mod prometheus_gauge;

pub use echo_rpc_server::EchoRpcServer;
pub use http_metrics_source::HttpMetricsSource;
pub use prometheus_gauge::ConnectionGauge;
