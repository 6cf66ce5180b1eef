//! Webhook Ingestion - Resolve, authenticate, persist, hand off

use super::event::{normalize_event_type, WebhookEnvelope, WebhookEvent};
use crate::queue::{Task, TaskQueue};
use chrono::Utc;
use parley_common::config::WebhookConfig;
use parley_common::signature::{self, SignatureError};
use parley_common::types::{TenantId, TenantScope, WebhookLogId};
use parley_storage::models::GatewaySession;
use parley_storage::repository::{CreateWebhookLog, Repositories};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Webhook ingestion errors
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Malformed webhook payload: {0}")]
    Malformed(String),

    #[error("Unknown instance: {0}")]
    UnknownInstance(String),

    #[error("Webhook rejected: {0}")]
    Unauthorized(#[from] SignatureError),

    #[error(transparent)]
    Storage(#[from] parley_common::Error),
}

/// One inbound callback as received over HTTP
#[derive(Debug, Clone, Copy)]
pub struct IngestRequest<'a> {
    pub instance_name: &'a str,
    pub body: &'a [u8],
    pub signature: Option<&'a str>,
    pub timestamp: Option<&'a str>,
}

/// A durably logged callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    pub log_id: WebhookLogId,
    pub tenant_id: TenantId,
}

/// Webhook Ingestion Gateway
pub struct WebhookIngestor {
    repos: Repositories,
    queue: TaskQueue,
    config: WebhookConfig,
}

impl WebhookIngestor {
    pub fn new(repos: Repositories, queue: TaskQueue, config: WebhookConfig) -> Self {
        Self {
            repos,
            queue,
            config,
        }
    }

    /// Accept one callback.
    ///
    /// Nothing is written unless the instance resolves and the signature
    /// verifies. Once the log entry is stored the call succeeds, whatever
    /// happens to the follow-up work.
    pub async fn ingest(&self, request: IngestRequest<'_>) -> Result<Accepted, IngestError> {
        let payload: Value = serde_json::from_slice(request.body)
            .map_err(|e| IngestError::Malformed(e.to_string()))?;
        let envelope: WebhookEnvelope = serde_json::from_value(payload.clone())
            .map_err(|e| IngestError::Malformed(e.to_string()))?;

        let Some((scope, session)) = self.resolve_instance(request.instance_name).await? else {
            warn!(instance = request.instance_name, "Webhook for unknown instance");
            return Err(IngestError::UnknownInstance(request.instance_name.to_string()));
        };

        signature::verify(
            &session.webhook_secret,
            request.signature,
            request.timestamp,
            request.body,
            Utc::now(),
            self.config.replay_window_secs,
        )
        .map_err(|e| {
            warn!(instance = request.instance_name, error = %e, "Webhook signature rejected");
            e
        })?;

        let event_type = normalize_event_type(&envelope.event);
        let log = self
            .repos
            .webhook_logs
            .create(
                scope,
                CreateWebhookLog {
                    session_id: session.id,
                    event_type: event_type.clone(),
                    payload,
                },
            )
            .await?;

        info!(
            tenant_id = %scope,
            instance = request.instance_name,
            event = %event_type,
            log_id = %log.id,
            "Webhook received"
        );

        // Connection changes show up immediately; reconciliation applies them again
        let event = WebhookEvent::parse(&event_type, &envelope.data);
        if let Some(change) = event.connection_change() {
            if let Err(e) = self
                .repos
                .sessions
                .apply_connection(scope, session.id, &change)
                .await
            {
                warn!(session_id = %session.id, error = %e, "Failed to apply connection change");
            }
        }

        let task = Task::ReconcileWebhook {
            tenant_id: scope.tenant_id,
            log_id: log.id,
        };
        if let Err(e) = self.queue.enqueue(&task).await {
            warn!(log_id = %log.id, error = %e, "Failed to enqueue reconciliation, left for the sweep");
        }

        Ok(Accepted {
            log_id: log.id,
            tenant_id: scope.tenant_id,
        })
    }

    /// Find the tenant and active session owning an instance id.
    ///
    /// The global index answers in one lookup. When it has no usable entry,
    /// every active tenant is scanned and the index is repaired on a hit.
    pub async fn resolve_instance(
        &self,
        instance_name: &str,
    ) -> parley_common::Result<Option<(TenantScope, GatewaySession)>> {
        if let Some(tenant_id) = self.repos.sessions.lookup_tenant(instance_name).await? {
            let tenant_active = self
                .repos
                .tenants
                .get(tenant_id)
                .await?
                .is_some_and(|t| t.is_active);
            if tenant_active {
                let scope = TenantScope::new(tenant_id);
                if let Some(session) = self
                    .repos
                    .sessions
                    .find_active_by_instance(scope, instance_name)
                    .await?
                {
                    return Ok(Some((scope, session)));
                }
            }
            debug!(instance = instance_name, "Index entry has no active session, scanning tenants");
        }

        for tenant in self.repos.tenants.list_active().await? {
            let scope = TenantScope::new(tenant.id);
            if let Some(session) = self
                .repos
                .sessions
                .find_active_by_instance(scope, instance_name)
                .await?
            {
                warn!(
                    instance = instance_name,
                    tenant_id = %tenant.id,
                    "Instance resolved by scan, repairing index"
                );
                self.repos
                    .sessions
                    .index_instance(instance_name, tenant.id, session.id)
                    .await?;
                return Ok(Some((scope, session)));
            }
        }

        Ok(None)
    }
}
