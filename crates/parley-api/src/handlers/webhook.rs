//! Gateway webhook intake
//!
//! The gateway does not say which tenant a callback belongs to; the
//! ingestor resolves that from the instance name in the path.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use parley_common::signature::{SIGNATURE_HEADER, TIMESTAMP_HEADER};
use parley_core::webhook::IngestRequest;
use parley_core::IngestError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::{api_error, from_common, ApiError};
use crate::state::AppState;

/// Acknowledgement for a stored callback
#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookAck {
    pub status: String,
}

/// Receive one gateway callback
///
/// POST /webhook/:instance_name
pub async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    Path(instance_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookAck>), ApiError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let accepted = state
        .ingestor
        .ingest(IngestRequest {
            instance_name: &instance_name,
            body: &body,
            signature: header(SIGNATURE_HEADER),
            timestamp: header(TIMESTAMP_HEADER),
        })
        .await
        .map_err(|e| match e {
            IngestError::Malformed(reason) => {
                api_error(StatusCode::BAD_REQUEST, "malformed_payload", reason)
            }
            IngestError::UnknownInstance(_) => {
                api_error(StatusCode::NOT_FOUND, "not_found", "Unknown instance")
            }
            IngestError::Unauthorized(reason) => {
                api_error(StatusCode::UNAUTHORIZED, "unauthorized", reason.to_string())
            }
            IngestError::Storage(e) => from_common(e),
        })?;

    debug!(log_id = %accepted.log_id, tenant_id = %accepted.tenant_id, "Webhook accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookAck {
            status: "received".to_string(),
        }),
    ))
}
