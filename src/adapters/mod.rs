//! Adapters Layer
//!
//! Inbound adapters accept traffic (forwarder, metrics endpoint); outbound
//! adapters implement the domain ports (HTTP metrics source, echo RPC server).

pub mod inbound;
pub mod outbound;
