//! Gateway session repository and the global instance index

use crate::db::{db_err, DatabasePool};
use crate::models::{ConnectionChange, GatewaySession, PhoneUpdate, SessionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_common::types::{SessionId, TenantId, TenantScope};
use parley_common::Result;
use uuid::Uuid;

/// Gateway session repository trait
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Insert a session and its global index entry atomically
    async fn create(&self, scope: TenantScope, input: CreateSession) -> Result<GatewaySession>;
    async fn get(&self, scope: TenantScope, id: SessionId) -> Result<Option<GatewaySession>>;
    async fn find_active_by_instance(
        &self,
        scope: TenantScope,
        instance_id: &str,
    ) -> Result<Option<GatewaySession>>;
    async fn list_active(&self, scope: TenantScope) -> Result<Vec<GatewaySession>>;
    /// Resolve an instance id to its tenant through the global index
    async fn lookup_tenant(&self, instance_id: &str) -> Result<Option<TenantId>>;
    /// Write (or overwrite) a global index entry
    async fn index_instance(
        &self,
        instance_id: &str,
        tenant_id: TenantId,
        session_id: SessionId,
    ) -> Result<()>;
    async fn apply_connection(
        &self,
        scope: TenantScope,
        id: SessionId,
        change: &ConnectionChange,
    ) -> Result<()>;
    async fn record_health(&self, scope: TenantScope, id: SessionId, healthy: bool) -> Result<()>;
    /// Count one successful send against the daily quota
    async fn record_send(&self, scope: TenantScope, id: SessionId) -> Result<()>;
    /// Zero the daily count of sessions whose last send is before `day_start`
    async fn reset_daily_counters(
        &self,
        scope: TenantScope,
        day_start: DateTime<Utc>,
    ) -> Result<u64>;
    async fn deactivate(&self, scope: TenantScope, id: SessionId) -> Result<bool>;
}

/// Create session input
#[derive(Debug, Clone)]
pub struct CreateSession {
    pub name: String,
    pub instance_id: String,
    pub access_token: Option<String>,
    pub webhook_secret: String,
    pub daily_message_limit: i32,
}

/// Database session repository
pub struct DbSessionRepository {
    pool: DatabasePool,
}

impl DbSessionRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionRepository for DbSessionRepository {
    async fn create(&self, scope: TenantScope, input: CreateSession) -> Result<GatewaySession> {
        let id = Uuid::now_v7();
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        let session = sqlx::query_as::<_, GatewaySession>(
            r#"
            INSERT INTO gateway_sessions (
                id, tenant_id, name, instance_id, status, access_token, webhook_secret,
                daily_message_limit, messages_sent_today, is_healthy, is_active,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, 'disconnected', $5, $6, $7, 0, true, true, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(scope.tenant_id)
        .bind(&input.name)
        .bind(&input.instance_id)
        .bind(&input.access_token)
        .bind(&input.webhook_secret)
        .bind(input.daily_message_limit)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO gateway_instances (instance_id, tenant_id, session_id, created_at)
            VALUES ($1, $2, $3, NOW())
            "#,
        )
        .bind(&input.instance_id)
        .bind(scope.tenant_id)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(session)
    }

    async fn get(&self, scope: TenantScope, id: SessionId) -> Result<Option<GatewaySession>> {
        sqlx::query_as::<_, GatewaySession>(
            "SELECT * FROM gateway_sessions WHERE id = $1 AND tenant_id = $2",
        )
        .bind(id)
        .bind(scope.tenant_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn find_active_by_instance(
        &self,
        scope: TenantScope,
        instance_id: &str,
    ) -> Result<Option<GatewaySession>> {
        sqlx::query_as::<_, GatewaySession>(
            r#"
            SELECT * FROM gateway_sessions
            WHERE instance_id = $1 AND tenant_id = $2 AND is_active = true
            "#,
        )
        .bind(instance_id)
        .bind(scope.tenant_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn list_active(&self, scope: TenantScope) -> Result<Vec<GatewaySession>> {
        sqlx::query_as::<_, GatewaySession>(
            r#"
            SELECT * FROM gateway_sessions
            WHERE tenant_id = $1 AND is_active = true
            ORDER BY created_at ASC
            "#,
        )
        .bind(scope.tenant_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn lookup_tenant(&self, instance_id: &str) -> Result<Option<TenantId>> {
        sqlx::query_scalar::<_, TenantId>(
            "SELECT tenant_id FROM gateway_instances WHERE instance_id = $1",
        )
        .bind(instance_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn index_instance(
        &self,
        instance_id: &str,
        tenant_id: TenantId,
        session_id: SessionId,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO gateway_instances (instance_id, tenant_id, session_id, created_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (instance_id) DO UPDATE SET
                tenant_id = EXCLUDED.tenant_id,
                session_id = EXCLUDED.session_id
            "#,
        )
        .bind(instance_id)
        .bind(tenant_id)
        .bind(session_id)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn apply_connection(
        &self,
        scope: TenantScope,
        id: SessionId,
        change: &ConnectionChange,
    ) -> Result<()> {
        let (set_phone, phone) = match &change.phone {
            PhoneUpdate::Keep => (false, None),
            PhoneUpdate::Set(phone) => (true, Some(phone.as_str())),
            PhoneUpdate::Clear => (true, None),
        };

        sqlx::query(
            r#"
            UPDATE gateway_sessions SET
                status = $3,
                is_healthy = COALESCE($4, is_healthy),
                last_health_check = CASE WHEN $4 IS NULL THEN last_health_check ELSE NOW() END,
                phone_number = CASE WHEN $5 THEN $6 ELSE phone_number END,
                updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(id)
        .bind(scope.tenant_id)
        .bind(change.status.to_string())
        .bind(change.is_healthy)
        .bind(set_phone)
        .bind(phone)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn record_health(&self, scope: TenantScope, id: SessionId, healthy: bool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE gateway_sessions SET
                is_healthy = $3,
                last_health_check = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(id)
        .bind(scope.tenant_id)
        .bind(healthy)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn record_send(&self, scope: TenantScope, id: SessionId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE gateway_sessions SET
                messages_sent_today = messages_sent_today + 1,
                last_message_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(id)
        .bind(scope.tenant_id)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn reset_daily_counters(
        &self,
        scope: TenantScope,
        day_start: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE gateway_sessions SET messages_sent_today = 0, updated_at = NOW()
            WHERE tenant_id = $1
              AND messages_sent_today <> 0
              AND (last_message_at IS NULL OR last_message_at < $2)
            "#,
        )
        .bind(scope.tenant_id)
        .bind(day_start)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn deactivate(&self, scope: TenantScope, id: SessionId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE gateway_sessions SET
                is_active = false,
                status = $3,
                updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2 AND is_active = true
            "#,
        )
        .bind(id)
        .bind(scope.tenant_id)
        .bind(SessionStatus::Disconnected.to_string())
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }
}
