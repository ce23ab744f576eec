//! Connection Forwarder
//!
//! Accepts TCP connections on a public address and relays them, byte for
//! byte, to an embedded RPC server listening on a private loopback port.
//! Every open relay is counted by a `ConnectionCounter`.

use crate::domain::ports::RpcServer;
use crate::infrastructure::{ConnectionCounter, ShutdownController};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use std::time::Duration;
use tokio::sync::watch;

/// Pause after a failed accept so a persistent error (e.g. EMFILE) does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle of a forwarder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderState {
    /// Created, `serve` not yet listening
    Init,
    /// RPC server running and public listener accepting
    Serving,
    /// `stop` observed, accept loop winding down
    Stopping,
    /// Listener closed and RPC server terminated
    Stopped,
}

/// Startup failures. These end the forwarder; nothing is retried.
#[derive(Debug, thiserror::Error)]
pub enum ForwarderError {
    #[error("forwarder already started")]
    AlreadyStarted,
    #[error("failed to start rpc server: {0}")]
    RpcStart(#[source] io::Error),
    #[error("failed to resolve {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Forwarder settings.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Listen backlog of the public socket
    pub backlog: u32,
    /// Where the embedded RPC server binds (port 0 picks a free port)
    pub rpc_bind_addr: SocketAddr,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            backlog: 8,
            rpc_bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        }
    }
}

/// Transparent TCP forwarder in front of an RPC server.
///
/// `serve` starts the RPC server, accepts clients and spawns two relay
/// tasks per client, one per direction. `stop` may be called from any
/// thread or task; it ends the accept loop and then the RPC server, while
/// relays already in flight run until their peers disconnect.
pub struct ConnectionForwarder {
    rpc_server: Arc<dyn RpcServer>,
    counter: Arc<ConnectionCounter>,
    config: ForwarderConfig,
    shutdown: ShutdownController,
    started: AtomicBool,
    state: watch::Sender<ForwarderState>,
    local_addr: Mutex<Option<SocketAddr>>,
    rpc_addr: Mutex<Option<SocketAddr>>,
}

impl ConnectionForwarder {
    /// Create a forwarder owning `rpc_server`.
    pub fn new(rpc_server: Arc<dyn RpcServer>) -> Self {
        let (state, _) = watch::channel(ForwarderState::Init);
        Self {
            rpc_server,
            counter: Arc::new(ConnectionCounter::new()),
            config: ForwarderConfig::default(),
            shutdown: ShutdownController::new(),
            started: AtomicBool::new(false),
            state,
            local_addr: Mutex::new(None),
            rpc_addr: Mutex::new(None),
        }
    }

    /// Set the callback notified with the connection count on every change.
    ///
    /// Same contract as `ConnectionCounter::on_change`: it runs under the
    /// counter lock, so it must be quick and must not touch the counter.
    pub fn on_connection_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(i64) + Send + Sync + 'static,
    {
        self.counter = Arc::new(ConnectionCounter::new().on_change(callback));
        self
    }

    pub fn with_config(mut self, config: ForwarderConfig) -> Self {
        self.config = config;
        self
    }

    /// Number of connections currently being relayed.
    pub fn active_connections(&self) -> i64 {
        self.counter.value()
    }

    pub fn state(&self) -> ForwarderState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ForwarderState> {
        self.state.subscribe()
    }

    /// Public address, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Address of the embedded RPC server, once started.
    pub fn rpc_addr(&self) -> Option<SocketAddr> {
        *self.rpc_addr.lock()
    }

    /// Run the forwarder on `host:port` until `stop` is called.
    ///
    /// Returns once the listener is closed and the RPC server has fully
    /// terminated. Fails immediately if the RPC server cannot start or the
    /// public address cannot be bound.
    pub async fn serve(&self, host: &str, port: u16) -> Result<(), ForwarderError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ForwarderError::AlreadyStarted);
        }

        let rpc_addr = match self.rpc_server.start(self.config.rpc_bind_addr).await {
            Ok(addr) => addr,
            Err(e) => {
                self.state.send_replace(ForwarderState::Stopped);
                return Err(ForwarderError::RpcStart(e));
            }
        };
        *self.rpc_addr.lock() = Some(rpc_addr);

        let listener = match Self::bind(host, port, self.config.backlog).await {
            Ok(listener) => listener,
            Err(e) => {
                self.terminate_rpc_server().await;
                self.state.send_replace(ForwarderState::Stopped);
                return Err(e);
            }
        };
        let local_addr = listener.local_addr().ok();
        *self.local_addr.lock() = local_addr;

        self.transition(ForwarderState::Init, ForwarderState::Serving);
        tracing::info!(
            "forwarder listening on {}:{} ({:?}), rpc server on {}",
            host,
            port,
            local_addr,
            rpc_addr
        );

        self.accept_loop(&listener, rpc_addr).await;
        drop(listener);

        self.transition(ForwarderState::Serving, ForwarderState::Stopping);
        self.terminate_rpc_server().await;
        self.state.send_replace(ForwarderState::Stopped);
        tracing::info!("forwarder on {}:{} stopped", host, port);

        Ok(())
    }

    /// Request shutdown. Idempotent.
    pub fn stop(&self) {
        if self.shutdown.shutdown() {
            tracing::info!("forwarder stop requested");
        }
        self.transition(ForwarderState::Serving, ForwarderState::Stopping);
    }

    fn transition(&self, from: ForwarderState, to: ForwarderState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    async fn terminate_rpc_server(&self) {
        self.rpc_server.stop().await;
        self.rpc_server.wait_for_termination().await;
    }

    /// Bind the public socket with `SO_REUSEADDR` and a small backlog.
    ///
    /// IPv4 is preferred when `host` resolves to both families.
    async fn bind(host: &str, port: u16, backlog: u32) -> Result<TcpListener, ForwarderError> {
        let display = format!("{}:{}", host, port);

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|source| ForwarderError::Resolve {
                addr: display.clone(),
                source,
            })?
            .collect();

        let addr = addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| ForwarderError::Resolve {
                addr: display.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
            })?;

        let bind_err = |source| ForwarderError::Bind {
            addr: display.clone(),
            source,
        };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        socket.listen(backlog).map_err(bind_err)
    }

    /// Accept until the stop signal fires.
    ///
    /// Accept errors are logged and followed by a short pause that still
    /// honours the stop signal; they never take the proxy down.
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn accept_loop(&self, listener: &TcpListener, rpc_addr: SocketAddr) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.wait() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tokio::spawn(Self::handle_connection(
                            stream,
                            addr,
                            rpc_addr,
                            self.counter.clone(),
                        ));
                    }
                    Err(e) => {
                        tracing::error!("accept error: {:?}", e);
                        if !self.pause_after_accept_error().await {
                            break;
                        }
                    }
                },
            }
        }
    }

    /// Wait out `ACCEPT_ERROR_BACKOFF`. Returns false if `stop` fired meanwhile.
    async fn pause_after_accept_error(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.wait() => false,
            _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => true,
        }
    }

    /// Pair one client with a fresh RPC server connection and start relaying.
    async fn handle_connection(
        client: TcpStream,
        client_addr: SocketAddr,
        rpc_addr: SocketAddr,
        counter: Arc<ConnectionCounter>,
    ) {
        let rpc = match TcpStream::connect(rpc_addr).await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(
                    "failed to connect {} to rpc server at {}: {:?}",
                    client_addr,
                    rpc_addr,
                    e
                );
                return;
            }
        };

        counter.increment();
        tracing::debug!("forwarding {} -> {}", client_addr, rpc_addr);

        let pair = Arc::new(ConnectionPair::new(counter));
        let (client_read, client_write) = client.into_split();
        let (rpc_read, rpc_write) = rpc.into_split();

        tokio::spawn(Self::forward(
            client_read,
            rpc_write,
            pair.clone(),
            Direction::ClientToServer,
        ));
        tokio::spawn(Self::forward(
            rpc_read,
            client_write,
            pair,
            Direction::ServerToClient,
        ));
    }

    /// Copy one direction until EOF, error, or the other direction closing.
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn forward(
        mut src: OwnedReadHalf,
        mut dst: OwnedWriteHalf,
        pair: Arc<ConnectionPair>,
        direction: Direction,
    ) {
        let mut closed = pair.subscribe();

        let result = tokio::select! {
            copied = tokio::io::copy(&mut src, &mut dst) => Some(copied),
            _ = closed.wait_for(|done| *done) => None,
        };

        match result {
            Some(Ok(bytes)) => tracing::trace!("{} finished after {} bytes", direction, bytes),
            Some(Err(e)) if is_teardown_error(&e) => {}
            Some(Err(e)) => tracing::debug!("{} error: {:?}", direction, e),
            None => tracing::trace!("{} closed by the other direction", direction),
        }

        let _ = dst.shutdown().await;
        drop(src);
        drop(dst);

        // The decrement happens when the last task drops `pair`.
        pair.close();
    }
}

/// Errors caused by the other direction tearing the pair down first.
fn is_teardown_error(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::NotConnected)
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    ClientToServer,
    ServerToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToServer => write!(f, "client->server"),
            Direction::ServerToClient => write!(f, "server->client"),
        }
    }
}

/// State shared by the two relay tasks of one connection.
///
/// `closed` tells the surviving direction to drop its halves. The counter
/// is decremented when the pair itself is dropped, which is after both
/// tasks have released their socket halves; the `decremented` flag keeps
/// that decrement to exactly once.
struct ConnectionPair {
    counter: Arc<ConnectionCounter>,
    decremented: AtomicBool,
    closed: watch::Sender<bool>,
}

impl ConnectionPair {
    fn new(counter: Arc<ConnectionCounter>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            counter,
            decremented: AtomicBool::new(false),
            closed,
        }
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Decrement the counter if no task has done so yet.
    fn release(&self) -> bool {
        if self
            .decremented
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.counter.decrement();
            true
        } else {
            false
        }
    }
}

impl Drop for ConnectionPair {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::adapters::outbound::EchoRpcServer;
    use async_trait::async_trait;
    use std::time::Duration;

    // RPC server that reports an address nobody listens on.
    struct DeadRpcServer {
        addr: SocketAddr,
    }

    impl DeadRpcServer {
        fn new() -> Self {
            let addr = std::net::TcpListener::bind("127.0.0.1:0")
                .unwrap()
                .local_addr()
                .unwrap();
            Self { addr }
        }
    }

    #[async_trait]
    impl RpcServer for DeadRpcServer {
        async fn start(&self, _addr: SocketAddr) -> io::Result<SocketAddr> {
            Ok(self.addr)
        }
        async fn stop(&self) {}
        async fn wait_for_termination(&self) {}
    }

    // RPC server that cannot start.
    struct FailingRpcServer;

    #[async_trait]
    impl RpcServer for FailingRpcServer {
        async fn start(&self, _addr: SocketAddr) -> io::Result<SocketAddr> {
            Err(io::Error::new(io::ErrorKind::AddrInUse, "port taken"))
        }
        async fn stop(&self) {}
        async fn wait_for_termination(&self) {}
    }

    fn counter() -> Arc<ConnectionCounter> {
        Arc::new(ConnectionCounter::new())
    }

    // ===== ConnectionPair Tests =====

    #[test]
    fn test_release_decrements_once() {
        let counter = counter();
        counter.increment();
        let pair = ConnectionPair::new(counter.clone());

        assert!(pair.release());
        assert!(!pair.release());
        assert_eq!(counter.value(), 0);
    }

    #[test]
    fn test_release_concurrent_directions() {
        for _ in 0..100 {
            let counter = counter();
            counter.increment();
            let pair = Arc::new(ConnectionPair::new(counter.clone()));

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let pair = pair.clone();
                    std::thread::spawn(move || pair.release())
                })
                .collect();
            let released: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();

            assert_eq!(released.iter().filter(|r| **r).count(), 1);
            assert_eq!(counter.value(), 0);
        }
    }

    #[tokio::test]
    async fn test_close_wakes_other_direction() {
        let pair = ConnectionPair::new(counter());
        let mut closed = pair.subscribe();

        pair.close();
        pair.close();

        let woke = tokio::time::timeout(Duration::from_millis(100), closed.wait_for(|d| *d)).await;
        assert!(woke.is_ok());
    }

    #[tokio::test]
    async fn test_subscribe_after_close_sees_closed() {
        let pair = ConnectionPair::new(counter());
        pair.close();

        let mut closed = pair.subscribe();
        let woke = tokio::time::timeout(Duration::from_millis(100), closed.wait_for(|d| *d)).await;
        assert!(woke.is_ok());
    }

    #[test]
    fn test_teardown_error_classification() {
        assert!(is_teardown_error(&io::Error::from(io::ErrorKind::NotConnected)));
        assert!(!is_teardown_error(&io::Error::from(io::ErrorKind::ConnectionReset)));
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::ClientToServer.to_string(), "client->server");
        assert_eq!(Direction::ServerToClient.to_string(), "server->client");
    }

    // ===== Forwarder Tests =====

    #[test]
    fn test_forwarder_new() {
        let forwarder = ConnectionForwarder::new(Arc::new(EchoRpcServer::new()));
        assert_eq!(forwarder.state(), ForwarderState::Init);
        assert_eq!(forwarder.active_connections(), 0);
        assert!(forwarder.local_addr().is_none());
        assert!(forwarder.rpc_addr().is_none());
    }

    #[test]
    fn test_forwarder_config_default() {
        let config = ForwarderConfig::default();
        assert_eq!(config.backlog, 8);
        assert!(config.rpc_bind_addr.ip().is_loopback());
        assert_eq!(config.rpc_bind_addr.port(), 0);
    }

    #[test]
    fn test_stop_before_serve_keeps_init() {
        let forwarder = ConnectionForwarder::new(Arc::new(EchoRpcServer::new()));
        forwarder.stop();
        forwarder.stop();
        assert_eq!(forwarder.state(), ForwarderState::Init);
    }

    #[tokio::test]
    async fn test_serve_after_stop_returns() {
        let forwarder = ConnectionForwarder::new(Arc::new(EchoRpcServer::new()));
        forwarder.stop();

        let result = tokio::time::timeout(Duration::from_secs(2), forwarder.serve("127.0.0.1", 0)).await;
        assert!(matches!(result, Ok(Ok(()))));
        assert_eq!(forwarder.state(), ForwarderState::Stopped);
    }

    #[tokio::test]
    async fn test_serve_twice_fails() {
        let forwarder = ConnectionForwarder::new(Arc::new(EchoRpcServer::new()));
        forwarder.stop();
        forwarder.serve("127.0.0.1", 0).await.unwrap();

        let result = forwarder.serve("127.0.0.1", 0).await;
        assert!(matches!(result, Err(ForwarderError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_serve_rpc_start_failure() {
        let forwarder = ConnectionForwarder::new(Arc::new(FailingRpcServer));

        let result = forwarder.serve("127.0.0.1", 0).await;
        assert!(matches!(result, Err(ForwarderError::RpcStart(_))));
        assert_eq!(forwarder.state(), ForwarderState::Stopped);
    }

    #[tokio::test]
    async fn test_serve_bind_conflict() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let forwarder = ConnectionForwarder::new(Arc::new(EchoRpcServer::new()));

        let result = forwarder.serve("127.0.0.1", port).await;
        match result {
            Err(ForwarderError::Bind { addr, .. }) => assert_eq!(addr, format!("127.0.0.1:{}", port)),
            other => panic!("expected bind error, got {:?}", other),
        }
        assert_eq!(forwarder.state(), ForwarderState::Stopped);
    }

    #[tokio::test]
    async fn test_serve_unresolvable_host() {
        let forwarder = ConnectionForwarder::new(Arc::new(EchoRpcServer::new()));

        let result = forwarder.serve("host.invalid", 0).await;
        assert!(matches!(result, Err(ForwarderError::Resolve { .. })));
    }

    #[tokio::test]
    async fn test_handle_connection_rpc_unreachable_keeps_count() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let connect_handle = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (stream, client_addr) = listener.accept().await.unwrap();
        let _client = connect_handle.await.unwrap();

        let counter = counter();
        let dead = DeadRpcServer::new();
        ConnectionForwarder::handle_connection(stream, client_addr, dead.addr, counter.clone()).await;

        assert_eq!(counter.value(), 0);
    }

    #[tokio::test]
    async fn test_forward_other_direction_closed() {
        // Two connected socket pairs; the task must return once the pair is
        // closed even though its source never sends anything.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).await.unwrap();
        let (b, _) = listener.accept().await.unwrap();

        let counter = counter();
        counter.increment();
        let pair = Arc::new(ConnectionPair::new(counter.clone()));

        let (a_read, _a_write) = a.into_split();
        let (_b_read, b_write) = b.into_split();
        let task = tokio::spawn(ConnectionForwarder::forward(
            a_read,
            b_write,
            pair.clone(),
            Direction::ClientToServer,
        ));

        pair.close();
        let finished = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(finished.is_ok());

        // This test still holds the pair, so the connection is still counted.
        assert_eq!(counter.value(), 1);
        drop(pair);
        assert_eq!(counter.value(), 0);
    }

    #[test]
    fn test_drop_pair_decrements_once() {
        let counter = counter();
        counter.increment();
        let pair = Arc::new(ConnectionPair::new(counter.clone()));
        let other = pair.clone();

        drop(pair);
        assert_eq!(counter.value(), 1);
        drop(other);
        assert_eq!(counter.value(), 0);
    }

    #[test]
    fn test_drop_after_release_does_not_decrement_again() {
        let counter = counter();
        counter.increment();
        counter.increment();
        let pair = ConnectionPair::new(counter.clone());

        assert!(pair.release());
        drop(pair);
        assert_eq!(counter.value(), 1);
    }

    #[tokio::test]
    async fn test_count_held_until_both_directions_finish() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let counter = counter();
        counter.increment();
        let pair = Arc::new(ConnectionPair::new(counter.clone()));

        let (client_read, client_write) = client.into_split();
        let (server_read, server_write) = server.into_split();

        // No data flows, so both directions stay open until aborted.
        let first = tokio::spawn(ConnectionForwarder::forward(
            client_read,
            server_write,
            pair.clone(),
            Direction::ClientToServer,
        ));
        let second = tokio::spawn(ConnectionForwarder::forward(
            server_read,
            client_write,
            pair.clone(),
            Direction::ServerToClient,
        ));
        drop(pair);
        assert_eq!(counter.value(), 1);

        first.abort();
        let _ = first.await;
        // The aborted task dropped its halves but never closed the pair.
        assert_eq!(counter.value(), 1);

        second.abort();
        let _ = second.await;
        assert_eq!(counter.value(), 0);
    }

    #[tokio::test]
    async fn test_accept_error_pause_waits() {
        let forwarder = ConnectionForwarder::new(Arc::new(EchoRpcServer::new()));

        let started = std::time::Instant::now();
        assert!(forwarder.pause_after_accept_error().await);
        assert!(started.elapsed() >= ACCEPT_ERROR_BACKOFF);
    }

    #[tokio::test]
    async fn test_accept_error_pause_honours_stop() {
        let forwarder = Arc::new(ConnectionForwarder::new(Arc::new(EchoRpcServer::new())));

        let stopper = forwarder.clone();
        let pause = tokio::spawn(async move { stopper.pause_after_accept_error().await });
        forwarder.stop();

        let resumed = tokio::time::timeout(Duration::from_secs(1), pause)
            .await
            .unwrap()
            .unwrap();
        assert!(!resumed);
    }
}
