//! Durable job queue backed by the `jobs` table

use crate::db::{db_err, DatabasePool};
use crate::models::Job;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_common::types::JobId;
use parley_common::Result;
use uuid::Uuid;

/// Job repository trait
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        run_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<JobId>;
    /// Enqueue unless a pending or running job on `queue` already carries `payload`
    async fn enqueue_if_absent(
        &self,
        queue: &str,
        payload: serde_json::Value,
        run_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<Option<JobId>>;
    /// Claim the oldest due job on `queue`, skipping jobs held by other workers
    async fn claim_next(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Job>>;
    async fn complete(&self, id: JobId) -> Result<()>;
    async fn retry(&self, id: JobId, error: &str, run_at: DateTime<Utc>) -> Result<()>;
    async fn fail(&self, id: JobId, error: &str) -> Result<()>;
    /// Return running jobs locked before `locked_before` to pending
    async fn requeue_stale(&self, locked_before: DateTime<Utc>) -> Result<u64>;
    /// Delete completed jobs last touched before `before`
    async fn purge_completed(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// Database job repository
pub struct DbJobRepository {
    pool: DatabasePool,
}

impl DbJobRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for DbJobRepository {
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        run_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<JobId> {
        let id = Uuid::now_v7();

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, queue, payload, status, attempts, max_attempts, run_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, 'pending', 0, $4, $5, NOW(), NOW())
            "#,
        )
        .bind(id)
        .bind(queue)
        .bind(&payload)
        .bind(max_attempts)
        .bind(run_at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(id)
    }

    async fn enqueue_if_absent(
        &self,
        queue: &str,
        payload: serde_json::Value,
        run_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<Option<JobId>> {
        sqlx::query_scalar::<_, JobId>(
            r#"
            INSERT INTO jobs (
                id, queue, payload, status, attempts, max_attempts, run_at, created_at, updated_at
            )
            SELECT $1, $2, $3, 'pending', 0, $4, $5, NOW(), NOW()
            WHERE NOT EXISTS (
                SELECT 1 FROM jobs
                WHERE queue = $2 AND payload = $3 AND status IN ('pending', 'running')
            )
            RETURNING id
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(queue)
        .bind(&payload)
        .bind(max_attempts)
        .bind(run_at)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn claim_next(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs SET
                status = 'running',
                locked_at = NOW(),
                attempts = attempts + 1,
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = $1 AND status = 'pending' AND run_at <= $2
                ORDER BY run_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(queue)
        .bind(now)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn complete(&self, id: JobId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET status = 'completed', locked_at = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn retry(&self, id: JobId, error: &str, run_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'pending',
                run_at = $2,
                last_error = $3,
                locked_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(run_at)
        .bind(error)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'failed',
                last_error = $2,
                locked_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn requeue_stale(&self, locked_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = 'pending', locked_at = NULL, updated_at = NOW()
            WHERE status = 'running' AND locked_at < $1
            "#,
        )
        .bind(locked_before)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn purge_completed(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE status = 'completed' AND updated_at < $1")
            .bind(before)
            .execute(self.pool.pool())
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}
