mod forwarder;
mod metrics_server;

pub use forwarder::{ConnectionForwarder, ForwarderConfig, ForwarderError, ForwarderState};
pub use metrics_server::MetricsServer;
