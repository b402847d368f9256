//! Health endpoint
//!
//! `GET /isAlive` answers `200 true` when the relay is healthy and
//! `500 false` otherwise; any other method gets a 404. When metrics are
//! enabled the same server exposes `GET /metrics`.

use axum::{
    extract::State,
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::error::{ProcessorError, Result};
use crate::metrics::RelayMetrics;
use crate::readiness::ReadinessAggregator;

#[derive(Clone)]
struct HealthState {
    readiness: Arc<ReadinessAggregator>,
    metrics: RelayMetrics,
}

/// Build the health router; `/metrics` is only routed when `serve_metrics` is set
pub fn router(readiness: Arc<ReadinessAggregator>, metrics: RelayMetrics, serve_metrics: bool) -> Router {
    let mut router = Router::new().route("/isAlive", any(is_alive_handler));
    if serve_metrics {
        router = router.route("/metrics", get(metrics_handler));
    }
    router.with_state(HealthState { readiness, metrics })
}

async fn is_alive_handler(method: Method, State(state): State<HealthState>) -> Response {
    if method != Method::GET {
        return StatusCode::NOT_FOUND.into_response();
    }

    if state.readiness.is_healthy().await {
        (StatusCode::OK, "true").into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "false").into_response()
    }
}

async fn metrics_handler(State(state): State<HealthState>) -> Response {
    debug!("Metrics endpoint called");

    match state.metrics.encode() {
        Ok(metrics) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            metrics,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
                .into_response()
        }
    }
}

pub struct HealthServer {
    addr: SocketAddr,
    router: Router,
}

impl HealthServer {
    pub fn new(port: u16, router: Router) -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], port)),
            router,
        }
    }

    /// Serve until `shutdown` resolves
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            ProcessorError::Configuration(format!("failed to bind health server on {}: {}", self.addr, e))
        })?;
        info!(addr = %self.addr, "Health server listening");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ProcessorError::Unexpected(e.to_string()))?;

        info!("Health server stopped");
        Ok(())
    }
}
