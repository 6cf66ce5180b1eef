//! Campaign handlers

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use parley_common::types::TenantScope;
use parley_core::campaign::CounterReport;
use parley_storage::models::Campaign;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::{from_campaign, ApiError};
use crate::state::AppState;

/// Campaign response
#[derive(Debug, Serialize, Deserialize)]
pub struct CampaignResponse {
    pub id: Uuid,
    pub session_id: Uuid,
    pub name: String,
    pub status: String,
    pub total_recipients: i32,
    pub sent_count: i32,
    pub delivered_count: i32,
    pub read_count: i32,
    pub failed_count: i32,
    pub progress_percentage: f64,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Campaign> for CampaignResponse {
    fn from(c: Campaign) -> Self {
        let progress = if c.total_recipients > 0 {
            f64::from(c.sent_count + c.failed_count) * 100.0 / f64::from(c.total_recipients)
        } else {
            0.0
        };
        Self {
            id: c.id,
            session_id: c.session_id,
            name: c.name,
            status: c.status,
            total_recipients: c.total_recipients,
            sent_count: c.sent_count,
            delivered_count: c.delivered_count,
            read_count: c.read_count,
            failed_count: c.failed_count,
            progress_percentage: progress.min(100.0),
            scheduled_at: c.scheduled_at,
            started_at: c.started_at,
            completed_at: c.completed_at,
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

/// Request body for scheduling a campaign
#[derive(Debug, Deserialize)]
pub struct ScheduleCampaignRequest {
    pub scheduled_at: DateTime<Utc>,
}

/// Query parameters for counter recalculation
#[derive(Debug, Default, Deserialize)]
pub struct RecalculateQuery {
    #[serde(default)]
    pub dry_run: bool,
}

type CampaignPath = Path<(Uuid, Uuid)>;

/// GET /api/v1/tenants/:tenant_id/campaigns/:campaign_id
pub async fn get_campaign(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, campaign_id)): CampaignPath,
) -> Result<Json<CampaignResponse>, ApiError> {
    let campaign = state
        .campaigns
        .get(TenantScope::new(tenant_id), campaign_id)
        .await
        .map_err(from_campaign)?;
    Ok(Json(campaign.into()))
}

/// POST /api/v1/tenants/:tenant_id/campaigns/:campaign_id/start
pub async fn start_campaign(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, campaign_id)): CampaignPath,
) -> Result<Json<CampaignResponse>, ApiError> {
    let campaign = state
        .campaigns
        .start(TenantScope::new(tenant_id), campaign_id)
        .await
        .map_err(from_campaign)?;
    Ok(Json(campaign.into()))
}

/// POST /api/v1/tenants/:tenant_id/campaigns/:campaign_id/pause
pub async fn pause_campaign(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, campaign_id)): CampaignPath,
) -> Result<Json<CampaignResponse>, ApiError> {
    let campaign = state
        .campaigns
        .pause(TenantScope::new(tenant_id), campaign_id)
        .await
        .map_err(from_campaign)?;
    Ok(Json(campaign.into()))
}

/// POST /api/v1/tenants/:tenant_id/campaigns/:campaign_id/resume
pub async fn resume_campaign(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, campaign_id)): CampaignPath,
) -> Result<Json<CampaignResponse>, ApiError> {
    let campaign = state
        .campaigns
        .resume(TenantScope::new(tenant_id), campaign_id)
        .await
        .map_err(from_campaign)?;
    Ok(Json(campaign.into()))
}

/// POST /api/v1/tenants/:tenant_id/campaigns/:campaign_id/cancel
pub async fn cancel_campaign(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, campaign_id)): CampaignPath,
) -> Result<Json<CampaignResponse>, ApiError> {
    let campaign = state
        .campaigns
        .cancel(TenantScope::new(tenant_id), campaign_id)
        .await
        .map_err(from_campaign)?;
    Ok(Json(campaign.into()))
}

/// POST /api/v1/tenants/:tenant_id/campaigns/:campaign_id/schedule
pub async fn schedule_campaign(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, campaign_id)): CampaignPath,
    Json(input): Json<ScheduleCampaignRequest>,
) -> Result<Json<CampaignResponse>, ApiError> {
    let campaign = state
        .campaigns
        .schedule(TenantScope::new(tenant_id), campaign_id, input.scheduled_at)
        .await
        .map_err(from_campaign)?;
    Ok(Json(campaign.into()))
}

/// Compare stored counters with the item table and fix drift unless `dry_run`
///
/// POST /api/v1/tenants/:tenant_id/campaigns/:campaign_id/recalculate
pub async fn recalculate_campaign(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, campaign_id)): CampaignPath,
    Query(query): Query<RecalculateQuery>,
) -> Result<Json<CounterReport>, ApiError> {
    let report = state
        .campaigns
        .recalculate_counters(TenantScope::new(tenant_id), campaign_id, query.dry_run)
        .await
        .map_err(from_campaign)?;
    Ok(Json(report))
}
