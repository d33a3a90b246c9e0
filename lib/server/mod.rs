pub mod monitoring;
use crate::state::AppState;
use prometheus_client::encoding::text::encode;

use axum::{extract::State, http::StatusCode, routing::get, Router};
use monitoring::EXPORT_METRICS;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::error;

async fn health_handler() -> String {
    "Healthy".to_string()
}

async fn expose_metrics(state: State<Arc<AppState>>) -> Result<String, StatusCode> {
    let mut buffer = String::new();
    let registry = state.registry.read().await;
    encode(&mut buffer, &registry).map_err(|err| {
        error!(event = "metrics_encode_failed", error = %err, "failed to encode metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(buffer)
}

/// Registers the export metrics into the shared registry.
///
/// Safe to call more than once; the metrics are created on the first call only.
pub async fn register_metrics(state: &AppState) {
    let mut registry = state.registry.write().await;
    if EXPORT_METRICS.initialized() {
        return;
    }
    EXPORT_METRICS
        .get_or_init(|| async { monitoring::ExportMetrics::register(&mut registry, "export") })
        .await;
    monitoring::register_build_info_metric(&mut registry, "export");
}

/// Starts the health/metrics HTTP server on the supplied socket address.
pub async fn setup_server_with_addr(
    state: Arc<AppState>,
    addr: SocketAddr,
) -> Result<tokio::task::JoinHandle<()>, std::io::Error> {
    register_metrics(&state).await;

    let shutdown_token = state.shutdown_token.clone();
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(expose_metrics))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_handle = tokio::spawn(async move {
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_token.cancelled().await;
        })
        .await;
        if let Err(err) = served {
            error!(event = "metrics_server_failed", error = %err, "metrics server stopped");
        }
    });

    Ok(server_handle)
}
