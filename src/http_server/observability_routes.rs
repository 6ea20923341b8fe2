//! Observability HTTP Routes
//!
//! Health check and stream counters.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;

use super::server::AppState;
use crate::observability::MetricsSnapshot;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Whether a ready publisher set is serving connections
    pub streaming: bool,
}

/// Metrics response
#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    #[serde(flatten)]
    pub counters: MetricsSnapshot,
    pub active_connections: u64,
    pub generation: u64,
    pub boot_version: u64,
}

/// Create observability routes
pub fn observability_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let streaming = state
        .supervisor
        .current_set()
        .map(|set| set.is_ready() && !set.token().is_cancelled())
        .unwrap_or(false);
    let response = HealthResponse {
        status: (if streaming { "ok" } else { "starting" }).to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        streaming,
    };
    let status = if streaming {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(response))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let supervisor = &state.supervisor;
    let response = MetricsResponse {
        counters: supervisor.metrics().snapshot(),
        active_connections: supervisor.metrics().active_connections(),
        generation: supervisor.generation(),
        boot_version: supervisor.boot_version(),
    };

    (StatusCode::OK, Json(response))
}
