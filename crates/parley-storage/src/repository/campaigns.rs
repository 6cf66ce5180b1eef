//! Campaign repository

use crate::db::{db_err, DatabasePool};
use crate::models::{Campaign, CampaignCounters, CampaignStatus, ItemStatus, TargetingRule};
use crate::repository::campaign_items::NewCampaignItem;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_common::types::{CampaignId, SessionId, TenantScope};
use parley_common::{Error, Result};
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

/// Rows per multi-row INSERT when populating items
const INSERT_CHUNK: usize = 1000;

/// Campaign repository trait
#[async_trait]
pub trait CampaignRepository: Send + Sync {
    async fn create(&self, scope: TenantScope, input: CreateCampaign) -> Result<Campaign>;
    async fn get(&self, scope: TenantScope, id: CampaignId) -> Result<Option<Campaign>>;
    /// Fresh read of the stored status only
    async fn status(&self, scope: TenantScope, id: CampaignId) -> Result<Option<CampaignStatus>>;
    async fn list_due_scheduled(
        &self,
        scope: TenantScope,
        now: DateTime<Utc>,
    ) -> Result<Vec<Campaign>>;
    /// RUNNING campaigns that still have PENDING items
    async fn list_running_with_pending(&self, scope: TenantScope) -> Result<Vec<CampaignId>>;
    /// Insert items and move DRAFT/SCHEDULED to RUNNING in one transaction.
    ///
    /// Returns `None` without writing anything when the campaign is no
    /// longer DRAFT or SCHEDULED by the time its row lock is held.
    async fn populate_and_start(
        &self,
        scope: TenantScope,
        id: CampaignId,
        items: Vec<NewCampaignItem>,
    ) -> Result<Option<Campaign>>;
    /// Conditional status change; `None` when the current status is not in `from`
    async fn transition(
        &self,
        scope: TenantScope,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<Option<Campaign>>;
    async fn schedule(
        &self,
        scope: TenantScope,
        id: CampaignId,
        at: DateTime<Utc>,
    ) -> Result<Option<Campaign>>;
    /// RUNNING to COMPLETED, only when no PENDING or QUEUED items remain
    async fn complete_if_drained(&self, scope: TenantScope, id: CampaignId) -> Result<bool>;
    /// Re-aggregate counters from the campaign's items
    async fn aggregate_counters(
        &self,
        scope: TenantScope,
        id: CampaignId,
    ) -> Result<CampaignCounters>;
    async fn overwrite_counters(
        &self,
        scope: TenantScope,
        id: CampaignId,
        counters: &CampaignCounters,
    ) -> Result<()>;
    async fn soft_delete(&self, scope: TenantScope, id: CampaignId) -> Result<bool>;
}

/// Create campaign input
#[derive(Debug, Clone)]
pub struct CreateCampaign {
    pub session_id: SessionId,
    pub name: String,
    pub message: String,
    pub media_url: Option<String>,
    pub media_type: Option<String>,
    pub target: TargetingRule,
    pub created_by: Option<Uuid>,
}

pub(crate) fn clamp_count(n: i64) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

/// Database campaign repository
pub struct DbCampaignRepository {
    pool: DatabasePool,
}

impl DbCampaignRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CampaignRepository for DbCampaignRepository {
    async fn create(&self, scope: TenantScope, input: CreateCampaign) -> Result<Campaign> {
        let target = serde_json::to_value(&input.target)
            .map_err(|e| Error::Validation(format!("Invalid targeting rule: {}", e)))?;

        sqlx::query_as::<_, Campaign>(
            r#"
            INSERT INTO campaigns (
                id, tenant_id, session_id, name, message, media_url, media_type, target,
                status, created_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'draft', $9, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(scope.tenant_id)
        .bind(input.session_id)
        .bind(&input.name)
        .bind(&input.message)
        .bind(&input.media_url)
        .bind(&input.media_type)
        .bind(target)
        .bind(input.created_by)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn get(&self, scope: TenantScope, id: CampaignId) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            r#"
            SELECT * FROM campaigns
            WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(scope.tenant_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn status(&self, scope: TenantScope, id: CampaignId) -> Result<Option<CampaignStatus>> {
        let status = sqlx::query_scalar::<_, String>(
            r#"
            SELECT status FROM campaigns
            WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(scope.tenant_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)?;

        status
            .map(|s| s.parse().map_err(Error::Database))
            .transpose()
    }

    async fn list_due_scheduled(
        &self,
        scope: TenantScope,
        now: DateTime<Utc>,
    ) -> Result<Vec<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            r#"
            SELECT * FROM campaigns
            WHERE tenant_id = $1
              AND status = 'scheduled'
              AND scheduled_at <= $2
              AND deleted_at IS NULL
            ORDER BY scheduled_at ASC
            "#,
        )
        .bind(scope.tenant_id)
        .bind(now)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn list_running_with_pending(&self, scope: TenantScope) -> Result<Vec<CampaignId>> {
        sqlx::query_scalar::<_, CampaignId>(
            r#"
            SELECT c.id FROM campaigns c
            WHERE c.tenant_id = $1
              AND c.status = 'running'
              AND c.deleted_at IS NULL
              AND EXISTS (
                  SELECT 1 FROM campaign_items i
                  WHERE i.campaign_id = c.id AND i.status = 'pending'
              )
            ORDER BY c.started_at ASC
            "#,
        )
        .bind(scope.tenant_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn populate_and_start(
        &self,
        scope: TenantScope,
        id: CampaignId,
        items: Vec<NewCampaignItem>,
    ) -> Result<Option<Campaign>> {
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        let status = sqlx::query_scalar::<_, String>(
            r#"
            SELECT status FROM campaigns
            WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL
            FOR UPDATE
            "#,
        )
        .bind(id)
        .bind(scope.tenant_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let populatable = [CampaignStatus::Draft.as_str(), CampaignStatus::Scheduled.as_str()];
        if !status.as_deref().is_some_and(|s| populatable.contains(&s)) {
            return Ok(None);
        }

        let mut inserted: u64 = 0;
        for chunk in items.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO campaign_items (id, tenant_id, campaign_id, contact_id, \
                 recipient_name, recipient_phone, substitutions, status, created_at, updated_at) ",
            );
            builder.push_values(chunk, |mut row, item| {
                row.push_bind(Uuid::now_v7())
                    .push_bind(scope.tenant_id)
                    .push_bind(id)
                    .push_bind(item.contact_id)
                    .push_bind(&item.recipient_name)
                    .push_bind(&item.recipient_phone)
                    .push_bind(&item.substitutions)
                    .push_bind(ItemStatus::Pending.as_str())
                    .push("NOW()")
                    .push("NOW()");
            });
            builder.push(" ON CONFLICT (campaign_id, recipient_phone) DO NOTHING");

            inserted += builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(db_err)?
                .rows_affected();
        }

        let campaign = sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE campaigns SET
                status = 'running',
                total_recipients = $3,
                started_at = COALESCE(started_at, NOW()),
                completed_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(scope.tenant_id)
        .bind(clamp_count(inserted as i64))
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(Some(campaign))
    }

    async fn transition(
        &self,
        scope: TenantScope,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<Option<Campaign>> {
        let from: Vec<String> = from.iter().map(|s| s.to_string()).collect();

        sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE campaigns SET
                status = $3,
                started_at = CASE WHEN $3 = 'running' THEN COALESCE(started_at, NOW()) ELSE started_at END,
                completed_at = CASE
                    WHEN $3 = 'running' THEN NULL
                    WHEN $3 IN ('completed', 'cancelled', 'failed') THEN NOW()
                    ELSE completed_at
                END,
                updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL AND status = ANY($4)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(scope.tenant_id)
        .bind(to.as_str())
        .bind(&from)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn schedule(
        &self,
        scope: TenantScope,
        id: CampaignId,
        at: DateTime<Utc>,
    ) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE campaigns SET
                status = 'scheduled',
                scheduled_at = $3,
                updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL AND status = 'draft'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(scope.tenant_id)
        .bind(at)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn complete_if_drained(&self, scope: TenantScope, id: CampaignId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns SET
                status = 'completed',
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2 AND status = 'running'
              AND NOT EXISTS (
                  SELECT 1 FROM campaign_items
                  WHERE campaign_id = $1 AND status IN ('pending', 'queued')
              )
            "#,
        )
        .bind(id)
        .bind(scope.tenant_id)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn aggregate_counters(
        &self,
        scope: TenantScope,
        id: CampaignId,
    ) -> Result<CampaignCounters> {
        let (total, sent, delivered, read, failed) =
            sqlx::query_as::<_, (i64, i64, i64, i64, i64)>(
                r#"
                SELECT
                    COUNT(*),
                    COUNT(*) FILTER (WHERE status IN ('sent', 'delivered', 'read')),
                    COUNT(*) FILTER (WHERE delivered_at IS NOT NULL),
                    COUNT(*) FILTER (WHERE read_at IS NOT NULL),
                    COUNT(*) FILTER (WHERE status = 'failed')
                FROM campaign_items
                WHERE campaign_id = $1 AND tenant_id = $2
                "#,
            )
            .bind(id)
            .bind(scope.tenant_id)
            .fetch_one(self.pool.pool())
            .await
            .map_err(db_err)?;

        Ok(CampaignCounters {
            total_recipients: clamp_count(total),
            sent: clamp_count(sent),
            delivered: clamp_count(delivered),
            read: clamp_count(read),
            failed: clamp_count(failed),
        })
    }

    async fn overwrite_counters(
        &self,
        scope: TenantScope,
        id: CampaignId,
        counters: &CampaignCounters,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE campaigns SET
                total_recipients = $3,
                sent_count = $4,
                delivered_count = $5,
                read_count = $6,
                failed_count = $7,
                updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(id)
        .bind(scope.tenant_id)
        .bind(counters.total_recipients)
        .bind(counters.sent)
        .bind(counters.delivered)
        .bind(counters.read)
        .bind(counters.failed)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn soft_delete(&self, scope: TenantScope, id: CampaignId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns SET deleted_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL AND status <> 'running'
            "#,
        )
        .bind(id)
        .bind(scope.tenant_id)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }
}
