//! Generic (non-campaign) message repository

use crate::db::{db_err, DatabasePool};
use crate::models::{plan_delivery_transition, DeliveryStatus, ItemStatus, Message};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_common::types::{MessageId, SessionId, TenantScope};
use parley_common::{Error, Result};
use uuid::Uuid;

/// Message repository trait
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn create(&self, scope: TenantScope, input: CreateMessage) -> Result<Message>;
    /// Match on the gateway-assigned id, then on the externally assigned id
    async fn find_by_gateway_id(&self, scope: TenantScope, id: &str) -> Result<Option<Message>>;
    async fn apply_delivery_status(
        &self,
        scope: TenantScope,
        id: MessageId,
        status: &DeliveryStatus,
        at: DateTime<Utc>,
    ) -> Result<bool>;
    /// Store the gateway id on messages known only by their external id
    async fn attach_gateway_id(
        &self,
        scope: TenantScope,
        external_id: &str,
        gateway_id: &str,
    ) -> Result<u64>;
}

/// Create message input
#[derive(Debug, Clone)]
pub struct CreateMessage {
    pub session_id: Option<SessionId>,
    pub phone: String,
    pub content: String,
    pub external_id: Option<String>,
    pub gateway_message_id: Option<String>,
}

/// Database message repository
pub struct DbMessageRepository {
    pool: DatabasePool,
}

impl DbMessageRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for DbMessageRepository {
    async fn create(&self, scope: TenantScope, input: CreateMessage) -> Result<Message> {
        sqlx::query_as::<_, Message>(
            r#"
            INSERT INTO messages (
                id, tenant_id, session_id, phone, content, status, external_id,
                gateway_message_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(scope.tenant_id)
        .bind(input.session_id)
        .bind(&input.phone)
        .bind(&input.content)
        .bind(&input.external_id)
        .bind(&input.gateway_message_id)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn find_by_gateway_id(&self, scope: TenantScope, id: &str) -> Result<Option<Message>> {
        sqlx::query_as::<_, Message>(
            r#"
            SELECT * FROM messages
            WHERE tenant_id = $1 AND (gateway_message_id = $2 OR external_id = $2)
            ORDER BY (gateway_message_id = $2) DESC NULLS LAST, created_at DESC
            LIMIT 1
            "#,
        )
        .bind(scope.tenant_id)
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn apply_delivery_status(
        &self,
        scope: TenantScope,
        id: MessageId,
        status: &DeliveryStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        let row = sqlx::query_as::<_, (String, bool, bool)>(
            r#"
            SELECT status, delivered_at IS NOT NULL, read_at IS NOT NULL
            FROM messages
            WHERE id = $1 AND tenant_id = $2
            FOR UPDATE
            "#,
        )
        .bind(id)
        .bind(scope.tenant_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some((current, delivered_set, read_set)) = row else {
            return Ok(false);
        };
        let current: ItemStatus = current.parse().map_err(Error::Database)?;
        let Some(plan) = plan_delivery_transition(current, delivered_set, read_set, status) else {
            return Ok(false);
        };

        sqlx::query(
            r#"
            UPDATE messages SET
                status = $3,
                sent_at = CASE WHEN $4 THEN COALESCE(sent_at, $8) ELSE sent_at END,
                delivered_at = CASE WHEN $5 THEN $8 ELSE delivered_at END,
                read_at = CASE WHEN $6 THEN $8 ELSE read_at END,
                failed_at = CASE WHEN $3 = 'failed' THEN $8 ELSE failed_at END,
                error_message = COALESCE($7, error_message),
                updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(id)
        .bind(scope.tenant_id)
        .bind(plan.to.as_str())
        .bind(plan.stamp_sent)
        .bind(plan.stamp_delivered)
        .bind(plan.stamp_read)
        .bind(&plan.error)
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn attach_gateway_id(
        &self,
        scope: TenantScope,
        external_id: &str,
        gateway_id: &str,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET
                gateway_message_id = $3,
                updated_at = NOW()
            WHERE tenant_id = $1 AND external_id = $2
              AND (gateway_message_id IS NULL OR gateway_message_id <> $3)
            "#,
        )
        .bind(scope.tenant_id)
        .bind(external_id)
        .bind(gateway_id)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}
