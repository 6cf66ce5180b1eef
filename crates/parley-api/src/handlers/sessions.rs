//! Session provisioning handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use parley_common::types::TenantScope;
use parley_storage::models::GatewaySession;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::{api_error, from_common, ApiError};
use crate::state::AppState;

/// Request body for provisioning a session
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub name: String,
    pub daily_limit: Option<i32>,
}

/// A freshly provisioned session.
///
/// The webhook secret is only ever returned here; it has to be configured on
/// the gateway side so callbacks can be signed.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedSessionResponse {
    pub id: Uuid,
    pub name: String,
    pub instance_id: String,
    pub status: String,
    pub webhook_secret: String,
    pub daily_message_limit: i32,
    pub created_at: DateTime<Utc>,
}

impl From<GatewaySession> for CreatedSessionResponse {
    fn from(s: GatewaySession) -> Self {
        Self {
            id: s.id,
            name: s.name,
            instance_id: s.instance_id,
            status: s.status,
            webhook_secret: s.webhook_secret,
            daily_message_limit: s.daily_message_limit,
            created_at: s.created_at,
        }
    }
}

/// Provision a gateway session for a tenant
///
/// POST /api/v1/tenants/:tenant_id/sessions
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<Uuid>,
    Json(input): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreatedSessionResponse>), ApiError> {
    let tenant = state
        .repos
        .tenants
        .get(tenant_id)
        .await
        .map_err(from_common)?
        .filter(|t| t.is_active)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "not_found", "Tenant not found"))?;

    let session = state
        .sessions
        .provision(TenantScope::new(tenant.id), &input.name, input.daily_limit)
        .await
        .map_err(from_common)?;

    Ok((StatusCode::CREATED, Json(session.into())))
}
