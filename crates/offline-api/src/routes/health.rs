//! Health check endpoints

use axum::{Json, Router, extract::State, routing::get};
use offline_core::LifecycleState;
use serde::Serialize;

use crate::state::AppState;

/// Health status response
///
/// The front is healthy whenever it answers; `state` tells whether requests
/// are being served from a generation or passed through.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub state: LifecycleState,
    pub active_generation: Option<String>,
}

/// Health check handler
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    metrics::counter!("offline_cache_health_checks_total").increment(1);

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        state: state.manager.state(),
        active_generation: state.manager.active_generation(),
    })
}

/// Create health routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
}
