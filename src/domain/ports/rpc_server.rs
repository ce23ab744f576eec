//! RPC Server Port
//!
//! Defines the interface the forwarder uses to run the RPC server it fronts.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;

/// An RPC server embedded in a `ConnectionForwarder`.
///
/// The forwarder treats the server as a black box: it starts it on an
/// ephemeral loopback port, dials that port once per accepted client, and
/// stops it when the accept loop exits. Implementations wrap whatever
/// framework actually serves the requests.
#[async_trait]
pub trait RpcServer: Send + Sync {
    /// Bind `addr` and start serving in the background.
    ///
    /// Returns the address actually bound, which differs from `addr` when
    /// the port is 0.
    async fn start(&self, addr: SocketAddr) -> io::Result<SocketAddr>;

    /// Stop accepting and cancel in-flight calls without waiting for them.
    async fn stop(&self);

    /// Wait until the server has fully terminated.
    async fn wait_for_termination(&self);
}
