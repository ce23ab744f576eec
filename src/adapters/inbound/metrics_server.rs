//! Metrics Exposition Server
//!
//! HTTP endpoint that publishes the forwarder's connection gauge so
//! `MetricsBasedServerFinder` instances can rank this forwarder.

use crate::adapters::outbound::ConnectionGauge;
use crate::infrastructure::ShutdownController;
use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Router,
};
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Bound metrics server, ready to `run`.
pub struct MetricsServer {
    listener: TcpListener,
    gauge: ConnectionGauge,
}

impl MetricsServer {
    /// Bind `addr` without serving yet.
    pub async fn bind(addr: &str, gauge: ConnectionGauge) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, gauge })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Routes: `GET /metrics` and `GET /health`.
    pub fn router(gauge: ConnectionGauge) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(gauge)
    }

    /// Serve until `shutdown` fires.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(self, shutdown: ShutdownController) -> io::Result<()> {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!("metrics endpoint listening on {}", addr);
        }

        let app = Self::router(self.gauge);
        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await
    }
}

async fn metrics_handler(State(gauge): State<ConnectionGauge>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)], gauge.render())
}

async fn health_handler() -> &'static str {
    "OK"
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_metrics_handler() {
        let gauge = ConnectionGauge::new("connections_num");
        gauge.set(4);
        let app = MetricsServer::router(gauge);

        let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            EXPOSITION_CONTENT_TYPE
        );
        let body = body_string(response).await;
        assert!(body.contains("# TYPE connections_num gauge"));
        assert!(body.contains("connections_num 4.0"));
    }

    #[tokio::test]
    async fn test_health_handler() {
        let app = MetricsServer::router(ConnectionGauge::new("connections_num"));

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "OK");
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let app = MetricsServer::router(ConnectionGauge::new("connections_num"));

        let request = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let gauge = ConnectionGauge::new("connections_num");
        let server = MetricsServer::bind("127.0.0.1:0", gauge.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = ShutdownController::new();
        let handle = tokio::spawn(server.run(shutdown.clone()));

        gauge.set(1);
        let body = reqwest::get(format!("http://{}/metrics", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("connections_num 1.0"));

        shutdown.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
