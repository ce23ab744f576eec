mod metrics_source;
mod rpc_server;

pub use metrics_source::{FetchError, MetricsSource};
pub use rpc_server::RpcServer;
