//! Status Reconciliation - Apply a logged webhook to the records it names

use super::event::WebhookEvent;
use chrono::{DateTime, Utc};
use parley_common::config::WebhookConfig;
use parley_common::types::{TenantScope, WebhookLogId};
use parley_common::{Error, Result};
use parley_storage::models::{DeliveryStatus, WebhookLog};
use parley_storage::repository::Repositories;
use serde_json::Value;
use tracing::{debug, error, info, warn};

/// Result of reconciling one log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A record changed
    Applied,
    /// The matching record was already in the reported state
    NoChange,
    /// No record matches the event
    Unmatched,
    /// The event carries nothing to apply
    Ignored,
    /// Already processed, or leased by another attempt
    Busy,
}

/// Status Reconciliation Engine
pub struct StatusReconciler {
    repos: Repositories,
    config: WebhookConfig,
}

impl StatusReconciler {
    pub fn new(repos: Repositories, config: WebhookConfig) -> Self {
        Self { repos, config }
    }

    /// Reconcile one log entry.
    ///
    /// The entry is marked processed on success and on a join miss. On error
    /// it stays unprocessed with the error recorded, and the error is
    /// returned so the job is retried.
    pub async fn reconcile(&self, scope: TenantScope, log_id: WebhookLogId) -> Result<ReconcileOutcome> {
        let lease = chrono::Duration::from_std(self.config.processing_lease())
            .map_err(|e| Error::Config(format!("processing lease out of range: {}", e)))?;

        let Some(log) = self
            .repos
            .webhook_logs
            .begin_processing(scope, log_id, Utc::now() - lease)
            .await?
        else {
            debug!(log_id = %log_id, "Webhook already processed or in progress");
            return Ok(ReconcileOutcome::Busy);
        };

        let data = log.payload.get("data").cloned().unwrap_or(Value::Null);
        let event = WebhookEvent::parse(&log.event_type, &data);

        match self.apply(scope, &log, &event).await {
            Ok((outcome, note)) => {
                self.repos
                    .webhook_logs
                    .mark_processed(scope, log_id, note.as_deref())
                    .await?;
                debug!(log_id = %log_id, ?outcome, "Webhook reconciled");
                Ok(outcome)
            }
            Err(e) => {
                error!(log_id = %log_id, event = %log.event_type, error = %e, "Webhook reconciliation failed");
                if let Err(record) = self
                    .repos
                    .webhook_logs
                    .record_error(scope, log_id, &e.to_string())
                    .await
                {
                    error!(log_id = %log_id, error = %record, "Failed to record reconciliation error");
                }
                Err(e)
            }
        }
    }

    async fn apply(
        &self,
        scope: TenantScope,
        log: &WebhookLog,
        event: &WebhookEvent,
    ) -> Result<(ReconcileOutcome, Option<String>)> {
        match event {
            WebhookEvent::QrCodeUpdated | WebhookEvent::ConnectionUpdate { .. } => {
                match event.connection_change() {
                    Some(change) => {
                        self.repos
                            .sessions
                            .apply_connection(scope, log.session_id, &change)
                            .await?;
                        info!(session_id = %log.session_id, status = %change.status, "Session connection updated");
                        Ok((ReconcileOutcome::Applied, None))
                    }
                    None => Ok((
                        ReconcileOutcome::Ignored,
                        Some("unrecognized connection state".into()),
                    )),
                }
            }
            WebhookEvent::MessageStatus { message_id, status } => {
                self.apply_status(scope, message_id, status, log.created_at)
                    .await
            }
            WebhookEvent::SendConfirmation {
                gateway_id,
                external_id,
            } => {
                let attached = self
                    .repos
                    .messages
                    .attach_gateway_id(scope, external_id, gateway_id)
                    .await?;
                if attached > 0 {
                    Ok((ReconcileOutcome::Applied, None))
                } else {
                    Ok((
                        ReconcileOutcome::NoChange,
                        Some(format!("no message awaiting gateway id for {}", external_id)),
                    ))
                }
            }
            WebhookEvent::Unsupported(kind) => {
                debug!(kind = %kind, "Unsupported webhook event");
                Ok((
                    ReconcileOutcome::Ignored,
                    Some(format!("unsupported event: {}", kind)),
                ))
            }
        }
    }

    /// Campaign items first, then generic messages; never creates a record
    async fn apply_status(
        &self,
        scope: TenantScope,
        message_id: &str,
        status: &DeliveryStatus,
        at: DateTime<Utc>,
    ) -> Result<(ReconcileOutcome, Option<String>)> {
        if let Some(item) = self.repos.items.find_by_message_id(scope, message_id).await? {
            let changed = self
                .repos
                .items
                .apply_delivery_status(scope, item.id, status, at)
                .await?;
            debug!(
                campaign_id = %item.campaign_id,
                item_id = %item.id,
                ?status,
                changed,
                "Campaign item status reconciled"
            );
            return Ok(changed_outcome(changed));
        }

        if let Some(message) = self.repos.messages.find_by_gateway_id(scope, message_id).await? {
            let changed = self
                .repos
                .messages
                .apply_delivery_status(scope, message.id, status, at)
                .await?;
            debug!(message_id = %message.id, ?status, changed, "Message status reconciled");
            return Ok(changed_outcome(changed));
        }

        warn!(tenant_id = %scope, gateway_message_id = message_id, "No record matches message id");
        Ok((
            ReconcileOutcome::Unmatched,
            Some(format!("no record for message id {}", message_id)),
        ))
    }
}

fn changed_outcome(changed: bool) -> (ReconcileOutcome, Option<String>) {
    if changed {
        (ReconcileOutcome::Applied, None)
    } else {
        (ReconcileOutcome::NoChange, None)
    }
}
