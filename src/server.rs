//! HTTP exposition of the metrics registry and loop status.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::engine::LoopStatus;
use crate::metrics::PrometheusMetrics;

#[derive(Clone)]
struct AppState {
    metrics: Arc<PrometheusMetrics>,
    status: watch::Receiver<LoopStatus>,
}

pub fn router(metrics: Arc<PrometheusMetrics>, status: watch::Receiver<LoopStatus>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .with_state(AppState { metrics, status })
}

/// Serves the router on `port` until `shutdown` flips to `true`.
pub async fn serve(
    port: u16,
    metrics: Arc<PrometheusMetrics>,
    status: watch::Receiver<LoopStatus>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Metrics server listening");

    axum::serve(listener, router(metrics, status))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    info!("Metrics server stopped");
    Ok(())
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("Content-Type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn status_handler(State(state): State<AppState>) -> Json<LoopStatus> {
    Json(state.status.borrow().clone())
}
