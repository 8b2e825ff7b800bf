//! HTTP server for the Prometheus `/metrics` endpoint.

use crate::metrics::MetricsCollector;
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use wgmgr_common::{WgMgrError, WgMgrResult};

/// A bound, not yet serving, metrics endpoint.
pub struct MetricsServer {
    listener: TcpListener,
    metrics: Arc<MetricsCollector>,
}

impl MetricsServer {
    /// Binds the listen address.
    ///
    /// Binding happens eagerly so an unusable address is reported at startup.
    pub async fn bind(addr: SocketAddr, metrics: Arc<MetricsCollector>) -> WgMgrResult<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            WgMgrError::invalid_config("metrics_address", format!("failed to bind {}: {}", addr, e))
        })?;
        Ok(Self { listener, metrics })
    }

    /// Returns the address actually bound (useful with port 0).
    pub fn local_addr(&self) -> WgMgrResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| WgMgrError::internal(format!("metrics listener address: {}", e)))
    }

    /// Serves `/metrics` until `shutdown` is cancelled.
    pub async fn serve(self, shutdown: CancellationToken) -> WgMgrResult<()> {
        let metrics = self.metrics;
        let app = Router::new().route(
            "/metrics",
            get(move || {
                let metrics_text = metrics.gather_metrics();
                async move { metrics_text }
            }),
        );

        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(address = %addr, "Serving metrics");
        }

        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| WgMgrError::internal(format!("metrics server error: {}", e)))
    }
}

/// Binds and starts the metrics server in a background task.
pub async fn spawn_metrics_server(
    addr: SocketAddr,
    metrics: Arc<MetricsCollector>,
    shutdown: CancellationToken,
) -> WgMgrResult<tokio::task::JoinHandle<WgMgrResult<()>>> {
    let server = MetricsServer::bind(addr, metrics).await?;
    Ok(tokio::spawn(server.serve(shutdown)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        metrics.set_connected_peers(3);

        let server = MetricsServer::bind("127.0.0.1:0".parse().unwrap(), metrics)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.serve(shutdown.clone()));

        let body = reqwest::get(format!("http://{}/metrics", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("wgmgr_connected_peers 3"));

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_config_error() {
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let first = MetricsServer::bind("127.0.0.1:0".parse().unwrap(), metrics.clone())
            .await
            .unwrap();
        let taken = first.local_addr().unwrap();

        match MetricsServer::bind(taken, metrics).await {
            Err(err) => assert!(err.is_fatal()),
            Ok(_) => panic!("Expected bind failure on {}", taken),
        }
    }
}
