//! Health check handlers

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::state::AppState;

/// Basic health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

/// Basic health check
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

/// Readiness check: storage must answer
pub async fn readiness(State(state): State<Arc<AppState>>) -> Result<StatusCode, StatusCode> {
    state.repos.tenants.list_active().await.map_err(|e| {
        warn!(error = %e, "Readiness check failed");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    Ok(StatusCode::OK)
}
