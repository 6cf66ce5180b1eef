//! Campaign item repository
//!
//! Items are claimed with `FOR UPDATE SKIP LOCKED` and flipped to QUEUED in
//! the same statement, so concurrent claimers never block on each other and
//! never receive the same item. Every status change that affects a campaign
//! counter updates the counter relatively in the same statement or
//! transaction.

use crate::db::{db_err, DatabasePool};
use crate::models::{
    plan_delivery_transition, CampaignItem, DeliveryStatus, ItemStatus, UnfinishedCounts,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_common::types::{CampaignId, CampaignItemId, ContactId, TenantScope};
use parley_common::{Error, Result};

/// Campaign item repository trait
#[async_trait]
pub trait CampaignItemRepository: Send + Sync {
    async fn list(&self, scope: TenantScope, campaign_id: CampaignId) -> Result<Vec<CampaignItem>>;
    /// Claim up to `limit` PENDING items, returned in claim order
    async fn claim_pending(
        &self,
        scope: TenantScope,
        campaign_id: CampaignId,
        limit: i64,
    ) -> Result<Vec<CampaignItem>>;
    async fn count_unfinished(
        &self,
        scope: TenantScope,
        campaign_id: CampaignId,
    ) -> Result<UnfinishedCounts>;
    /// QUEUED to SENT plus `sent + 1`; `false` if the item was not QUEUED
    async fn record_sent(
        &self,
        scope: TenantScope,
        id: CampaignItemId,
        message_id: Option<&str>,
    ) -> Result<bool>;
    /// QUEUED to FAILED plus `failed + 1`; `false` if the item was not QUEUED
    async fn record_failed(&self, scope: TenantScope, id: CampaignItemId, error: &str)
        -> Result<bool>;
    /// Return unsent QUEUED items to PENDING
    async fn release(&self, scope: TenantScope, ids: &[CampaignItemId]) -> Result<u64>;
    /// Return QUEUED items claimed before `claimed_before` to PENDING.
    ///
    /// Returns the campaigns that had items requeued.
    async fn requeue_stale(
        &self,
        scope: TenantScope,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<CampaignId>>;
    async fn find_by_message_id(
        &self,
        scope: TenantScope,
        message_id: &str,
    ) -> Result<Option<CampaignItem>>;
    /// Apply a gateway status to one item and its campaign counters.
    ///
    /// Returns `false` when the status caused no transition.
    async fn apply_delivery_status(
        &self,
        scope: TenantScope,
        id: CampaignItemId,
        status: &DeliveryStatus,
        at: DateTime<Utc>,
    ) -> Result<bool>;
}

/// Item to insert at population time
#[derive(Debug, Clone, PartialEq)]
pub struct NewCampaignItem {
    pub contact_id: Option<ContactId>,
    pub recipient_name: String,
    /// Digits only
    pub recipient_phone: String,
    /// Values available to message placeholders
    pub substitutions: serde_json::Value,
}

/// Database campaign item repository
pub struct DbCampaignItemRepository {
    pool: DatabasePool,
}

impl DbCampaignItemRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CampaignItemRepository for DbCampaignItemRepository {
    async fn list(&self, scope: TenantScope, campaign_id: CampaignId) -> Result<Vec<CampaignItem>> {
        sqlx::query_as::<_, CampaignItem>(
            r#"
            SELECT * FROM campaign_items
            WHERE campaign_id = $1 AND tenant_id = $2
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(campaign_id)
        .bind(scope.tenant_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn claim_pending(
        &self,
        scope: TenantScope,
        campaign_id: CampaignId,
        limit: i64,
    ) -> Result<Vec<CampaignItem>> {
        let mut items = sqlx::query_as::<_, CampaignItem>(
            r#"
            UPDATE campaign_items SET
                status = 'queued',
                claimed_at = NOW(),
                updated_at = NOW()
            WHERE id IN (
                SELECT id FROM campaign_items
                WHERE campaign_id = $1 AND tenant_id = $2 AND status = 'pending'
                ORDER BY created_at ASC, id ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(campaign_id)
        .bind(scope.tenant_id)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)?;

        // RETURNING does not preserve the subquery order
        items.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(items)
    }

    async fn count_unfinished(
        &self,
        scope: TenantScope,
        campaign_id: CampaignId,
    ) -> Result<UnfinishedCounts> {
        let (pending, queued) = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending'),
                COUNT(*) FILTER (WHERE status = 'queued')
            FROM campaign_items
            WHERE campaign_id = $1 AND tenant_id = $2
            "#,
        )
        .bind(campaign_id)
        .bind(scope.tenant_id)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(UnfinishedCounts { pending, queued })
    }

    async fn record_sent(
        &self,
        scope: TenantScope,
        id: CampaignItemId,
        message_id: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            WITH moved AS (
                UPDATE campaign_items SET
                    status = 'sent',
                    sent_at = NOW(),
                    message_id = $3,
                    error_message = NULL,
                    updated_at = NOW()
                WHERE id = $1 AND tenant_id = $2 AND status = 'queued'
                RETURNING campaign_id
            )
            UPDATE campaigns SET
                sent_count = sent_count + 1,
                updated_at = NOW()
            WHERE id IN (SELECT campaign_id FROM moved)
            "#,
        )
        .bind(id)
        .bind(scope.tenant_id)
        .bind(message_id)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_failed(
        &self,
        scope: TenantScope,
        id: CampaignItemId,
        error: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            WITH moved AS (
                UPDATE campaign_items SET
                    status = 'failed',
                    error_message = $3,
                    updated_at = NOW()
                WHERE id = $1 AND tenant_id = $2 AND status = 'queued'
                RETURNING campaign_id
            )
            UPDATE campaigns SET
                failed_count = failed_count + 1,
                updated_at = NOW()
            WHERE id IN (SELECT campaign_id FROM moved)
            "#,
        )
        .bind(id)
        .bind(scope.tenant_id)
        .bind(error)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, scope: TenantScope, ids: &[CampaignItemId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            UPDATE campaign_items SET
                status = 'pending',
                claimed_at = NULL,
                updated_at = NOW()
            WHERE id = ANY($1) AND tenant_id = $2 AND status = 'queued'
            "#,
        )
        .bind(ids)
        .bind(scope.tenant_id)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn requeue_stale(
        &self,
        scope: TenantScope,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<CampaignId>> {
        let mut campaigns = sqlx::query_scalar::<_, CampaignId>(
            r#"
            UPDATE campaign_items SET
                status = 'pending',
                claimed_at = NULL,
                updated_at = NOW()
            WHERE tenant_id = $1 AND status = 'queued' AND claimed_at < $2
            RETURNING campaign_id
            "#,
        )
        .bind(scope.tenant_id)
        .bind(claimed_before)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)?;

        campaigns.sort();
        campaigns.dedup();
        Ok(campaigns)
    }

    async fn find_by_message_id(
        &self,
        scope: TenantScope,
        message_id: &str,
    ) -> Result<Option<CampaignItem>> {
        sqlx::query_as::<_, CampaignItem>(
            r#"
            SELECT * FROM campaign_items
            WHERE tenant_id = $1 AND message_id = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(scope.tenant_id)
        .bind(message_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn apply_delivery_status(
        &self,
        scope: TenantScope,
        id: CampaignItemId,
        status: &DeliveryStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        let row = sqlx::query_as::<_, (String, bool, bool, CampaignId)>(
            r#"
            SELECT status, delivered_at IS NOT NULL, read_at IS NOT NULL, campaign_id
            FROM campaign_items
            WHERE id = $1 AND tenant_id = $2
            FOR UPDATE
            "#,
        )
        .bind(id)
        .bind(scope.tenant_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some((current, delivered_set, read_set, campaign_id)) = row else {
            return Ok(false);
        };
        let current: ItemStatus = current.parse().map_err(Error::Database)?;

        let Some(plan) = plan_delivery_transition(current, delivered_set, read_set, status) else {
            return Ok(false);
        };

        sqlx::query(
            r#"
            UPDATE campaign_items SET
                status = $3,
                sent_at = CASE WHEN $4 THEN COALESCE(sent_at, $8) ELSE sent_at END,
                delivered_at = CASE WHEN $5 THEN $8 ELSE delivered_at END,
                read_at = CASE WHEN $6 THEN $8 ELSE read_at END,
                claimed_at = CASE WHEN $9 THEN COALESCE(claimed_at, NOW()) ELSE claimed_at END,
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
        .bind(plan.stamp_claimed)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            UPDATE campaigns SET
                sent_count = sent_count + $3,
                delivered_count = delivered_count + $4,
                read_count = read_count + $5,
                failed_count = failed_count + $6,
                updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(campaign_id)
        .bind(scope.tenant_id)
        .bind(plan.sent_delta)
        .bind(plan.delivered_delta)
        .bind(plan.read_delta)
        .bind(plan.failed_delta)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }
}
