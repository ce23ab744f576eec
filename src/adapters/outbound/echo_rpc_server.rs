//! Echo RPC Server
//!
//! Minimal RpcServer that writes every received byte back to the caller.
//! Used by the `rpc-forwarder` binary and by the forwarder tests.

use crate::domain::ports::RpcServer;
use crate::infrastructure::ShutdownController;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

pub struct EchoRpcServer {
    shutdown: ShutdownController,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EchoRpcServer {
    pub fn new() -> Self {
        Self {
            shutdown: ShutdownController::new(),
            task: Mutex::new(None),
        }
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn accept_loop(listener: TcpListener, shutdown: ShutdownController) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tracing::trace!("echo server accepted {}", addr);
                        connections.spawn(Self::echo(stream));
                    }
                    Err(e) => tracing::error!("echo server accept error: {:?}", e),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.wait() => break,
            }
        }

        // Non-graceful: in-flight calls are cancelled, not drained.
        connections.shutdown().await;
        tracing::debug!("echo server terminated");
    }

    async fn echo(mut stream: TcpStream) {
        let (mut reader, mut writer) = stream.split();
        if let Err(e) = tokio::io::copy(&mut reader, &mut writer).await {
            tracing::trace!("echo copy error: {:?}", e);
        }
        let _ = writer.shutdown().await;
    }
}

impl Default for EchoRpcServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RpcServer for EchoRpcServer {
    async fn start(&self, addr: SocketAddr) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let handle = tokio::spawn(Self::accept_loop(listener, self.shutdown.clone()));
        *self.task.lock() = Some(handle);

        tracing::debug!("echo server listening on {}", local_addr);
        Ok(local_addr)
    }

    async fn stop(&self) {
        self.shutdown.shutdown();
    }

    async fn wait_for_termination(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_echo_roundtrip() {
        let server = EchoRpcServer::new();
        let addr = server.start(loopback()).await.unwrap();
        assert_ne!(addr.port(), 0);

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GetValue 42").await.unwrap();

        let mut buf = [0u8; 11];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GetValue 42");

        server.stop().await;
        server.wait_for_termination().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight_connections() {
        let server = EchoRpcServer::new();
        let addr = server.start(loopback()).await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();

        server.stop().await;
        let terminated =
            tokio::time::timeout(Duration::from_secs(2), server.wait_for_termination()).await;
        assert!(terminated.is_ok());

        // The aborted connection is closed from the server side.
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_wait_for_termination_without_start() {
        let server = EchoRpcServer::default();
        let result =
            tokio::time::timeout(Duration::from_millis(100), server.wait_for_termination()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_start_bind_conflict() {
        let taken = TcpListener::bind(loopback()).await.unwrap();
        let server = EchoRpcServer::new();

        let result = server.start(taken.local_addr().unwrap()).await;
        assert!(result.is_err());
    }
}
