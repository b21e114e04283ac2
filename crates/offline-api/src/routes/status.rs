//! Manager status and refresh endpoints

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use offline_core::{ActivationReport, ClearReport, InstallReport, ManagerStatus};
use serde::Serialize;
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;

/// Release the front is configured with
#[derive(Serialize)]
pub struct ReleaseInfo {
    pub generation: String,
    pub version: String,
    pub offline_page: String,
    pub manifest: Vec<String>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub manager: ManagerStatus,
    pub release: ReleaseInfo,
}

#[derive(Serialize)]
pub struct RefreshResponse {
    pub install: InstallReport,
    pub activation: ActivationReport,
}

/// GET /_offline/status
async fn get_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let manager = state.manager.status().await?;

    Ok(Json(StatusResponse {
        manager,
        release: ReleaseInfo {
            generation: state.release.generation(),
            version: state.release.version().to_string(),
            offline_page: state.release.offline_page().to_string(),
            manifest: state.release.manifest().entries().to_vec(),
        },
    }))
}

/// POST /_offline/refresh - re-run install and activate for the configured release
async fn refresh(State(state): State<AppState>) -> Result<Json<RefreshResponse>, ApiError> {
    info!("Refresh requested for {}", state.release.generation());

    let (install, activation) = state.manager.install_and_activate(&state.release).await?;

    Ok(Json(RefreshResponse {
        install,
        activation,
    }))
}

/// POST /_offline/clear - drop every cache generation and pass requests through
async fn clear(State(state): State<AppState>) -> Result<Json<ClearReport>, ApiError> {
    info!("Cache clear requested");

    let report = state.manager.clear().await?;
    Ok(Json(report))
}

/// Create status routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/_offline/status", get(get_status))
        .route("/_offline/refresh", post(refresh))
        .route("/_offline/clear", post(clear))
}
