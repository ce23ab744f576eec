//! rpc-forwarder - connection-counting TCP forwarder
//!
//! This is the composition root: it runs a demo echo RPC server behind a
//! `ConnectionForwarder` and publishes the live connection count on a
//! Prometheus-style metrics endpoint.

use rpc_balancer::infrastructure::shutdown_signal;
use rpc_balancer::{
    load_config, ConnectionForwarder, ConnectionGauge, EchoRpcServer, ForwarderConfig,
    MetricsServer, ShutdownController,
};
use std::sync::Arc;
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    tracing::info!(
        "starting rpc-forwarder listen={}:{} metrics={} metric={}",
        cfg.listen_host,
        cfg.listen_port,
        cfg.metrics_addr,
        cfg.metric_name
    );

    // Metrics endpoint fed by the forwarder's counter callback
    let gauge = ConnectionGauge::new(cfg.metric_name.clone());
    let metrics_server = MetricsServer::bind(&cfg.metrics_addr, gauge.clone()).await?;
    let metrics_shutdown = ShutdownController::new();
    let metrics_handle = tokio::spawn(metrics_server.run(metrics_shutdown.clone()));

    let forwarder = Arc::new(
        ConnectionForwarder::new(Arc::new(EchoRpcServer::new()))
            .with_config(ForwarderConfig {
                backlog: cfg.backlog,
                ..Default::default()
            })
            .on_connection_change(move |count| gauge.set(count)),
    );

    // Stop the forwarder on Ctrl+C / SIGTERM
    let signal = ShutdownController::new();
    tokio::spawn(shutdown_signal(signal.clone()));
    let stopper = forwarder.clone();
    tokio::spawn(async move {
        signal.wait().await;
        stopper.stop();
    });

    let result = forwarder.serve(&cfg.listen_host, cfg.listen_port).await;

    metrics_shutdown.shutdown();
    metrics_handle.await??;

    result?;
    Ok(())
}
