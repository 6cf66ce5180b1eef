//! API request handlers

pub mod campaigns;
pub mod health;
pub mod sessions;
pub mod webhook;

use axum::{http::StatusCode, Json};
use parley_core::CampaignError;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// What every fallible handler returns on failure
pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub(crate) fn api_error(status: StatusCode, error: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.into(),
        }),
    )
}

/// Map a storage or validation error; internal details stay in the log
pub(crate) fn from_common(e: parley_common::Error) -> ApiError {
    let status =
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if !e.is_client_facing() {
        error!(error = %e, "Request failed");
        return api_error(status, "internal_error", "Internal server error");
    }
    api_error(status, &e.code().to_ascii_lowercase(), e.to_string())
}

pub(crate) fn from_campaign(e: CampaignError) -> ApiError {
    match e {
        CampaignError::NotFound => {
            api_error(StatusCode::NOT_FOUND, "not_found", "Campaign not found")
        }
        CampaignError::InvalidState { .. } => {
            api_error(StatusCode::CONFLICT, "invalid_state", e.to_string())
        }
        CampaignError::NoTargetSelected => api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "no_target_selected",
            e.to_string(),
        ),
        CampaignError::NoRecipientsFound => api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "no_recipients_found",
            e.to_string(),
        ),
        CampaignError::InvalidSchedule(_) => api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "invalid_schedule",
            e.to_string(),
        ),
        CampaignError::Storage(e) => from_common(e),
    }
}
