//! Webhook log repository

use crate::db::{db_err, DatabasePool};
use crate::models::WebhookLog;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_common::types::{SessionId, TenantScope, WebhookLogId};
use parley_common::Result;
use uuid::Uuid;

/// Webhook log repository trait
#[async_trait]
pub trait WebhookLogRepository: Send + Sync {
    async fn create(&self, scope: TenantScope, input: CreateWebhookLog) -> Result<WebhookLog>;
    async fn get(&self, scope: TenantScope, id: WebhookLogId) -> Result<Option<WebhookLog>>;
    /// Take the processing lease on an unprocessed entry.
    ///
    /// Returns `None` when the entry is processed, missing, or leased by an
    /// attempt that started after `lease_cutoff`.
    async fn begin_processing(
        &self,
        scope: TenantScope,
        id: WebhookLogId,
        lease_cutoff: DateTime<Utc>,
    ) -> Result<Option<WebhookLog>>;
    async fn mark_processed(
        &self,
        scope: TenantScope,
        id: WebhookLogId,
        note: Option<&str>,
    ) -> Result<()>;
    /// Record a failed attempt and release the lease; the entry stays unprocessed
    async fn record_error(&self, scope: TenantScope, id: WebhookLogId, error: &str) -> Result<()>;
    /// Unprocessed entries the sweep may hand back to the reconcile queue
    async fn list_unprocessed(
        &self,
        scope: TenantScope,
        filter: &UnprocessedFilter,
    ) -> Result<Vec<WebhookLogId>>;
}

/// Bounds for the unprocessed-entry sweep.
///
/// Entries younger than `created_before`, leased after `lease_cutoff`, or
/// already attempted `max_attempts` times are left alone.
#[derive(Debug, Clone, Copy)]
pub struct UnprocessedFilter {
    pub created_before: DateTime<Utc>,
    pub lease_cutoff: DateTime<Utc>,
    pub max_attempts: i32,
    pub limit: i64,
}

/// Create webhook log input
#[derive(Debug, Clone)]
pub struct CreateWebhookLog {
    pub session_id: SessionId,
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// Database webhook log repository
pub struct DbWebhookLogRepository {
    pool: DatabasePool,
}

impl DbWebhookLogRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookLogRepository for DbWebhookLogRepository {
    async fn create(&self, scope: TenantScope, input: CreateWebhookLog) -> Result<WebhookLog> {
        sqlx::query_as::<_, WebhookLog>(
            r#"
            INSERT INTO webhook_logs (
                id, tenant_id, session_id, event_type, payload, processed, attempts, created_at
            )
            VALUES ($1, $2, $3, $4, $5, false, 0, NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(scope.tenant_id)
        .bind(input.session_id)
        .bind(&input.event_type)
        .bind(&input.payload)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn get(&self, scope: TenantScope, id: WebhookLogId) -> Result<Option<WebhookLog>> {
        sqlx::query_as::<_, WebhookLog>(
            "SELECT * FROM webhook_logs WHERE id = $1 AND tenant_id = $2",
        )
        .bind(id)
        .bind(scope.tenant_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn begin_processing(
        &self,
        scope: TenantScope,
        id: WebhookLogId,
        lease_cutoff: DateTime<Utc>,
    ) -> Result<Option<WebhookLog>> {
        sqlx::query_as::<_, WebhookLog>(
            r#"
            UPDATE webhook_logs SET
                locked_at = NOW(),
                attempts = attempts + 1
            WHERE id = $1 AND tenant_id = $2
              AND processed = false
              AND (locked_at IS NULL OR locked_at < $3)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(scope.tenant_id)
        .bind(lease_cutoff)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn mark_processed(
        &self,
        scope: TenantScope,
        id: WebhookLogId,
        note: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE webhook_logs SET
                processed = true,
                processed_at = NOW(),
                locked_at = NULL,
                error = $3
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(id)
        .bind(scope.tenant_id)
        .bind(note)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn record_error(&self, scope: TenantScope, id: WebhookLogId, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE webhook_logs SET
                error = $3,
                locked_at = NULL
            WHERE id = $1 AND tenant_id = $2 AND processed = false
            "#,
        )
        .bind(id)
        .bind(scope.tenant_id)
        .bind(error)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_unprocessed(
        &self,
        scope: TenantScope,
        filter: &UnprocessedFilter,
    ) -> Result<Vec<WebhookLogId>> {
        sqlx::query_scalar::<_, WebhookLogId>(
            r#"
            SELECT id FROM webhook_logs
            WHERE tenant_id = $1
              AND processed = false
              AND created_at < $2
              AND (locked_at IS NULL OR locked_at < $3)
              AND attempts < $4
            ORDER BY created_at ASC
            LIMIT $5
            "#,
        )
        .bind(scope.tenant_id)
        .bind(filter.created_before)
        .bind(filter.lease_cutoff)
        .bind(filter.max_attempts)
        .bind(filter.limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }
}
