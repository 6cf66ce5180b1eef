//! Tenant repository

use crate::db::{db_err, DatabasePool};
use crate::models::Tenant;
use async_trait::async_trait;
use parley_common::types::TenantId;
use parley_common::Result;
use uuid::Uuid;

/// Tenant repository trait
#[async_trait]
pub trait TenantRepository: Send + Sync {
    async fn create(&self, input: CreateTenant) -> Result<Tenant>;
    async fn get(&self, id: TenantId) -> Result<Option<Tenant>>;
    async fn list_active(&self) -> Result<Vec<Tenant>>;
}

/// Create tenant input
#[derive(Debug, Clone)]
pub struct CreateTenant {
    pub name: String,
    pub slug: String,
}

/// Database tenant repository
pub struct DbTenantRepository {
    pool: DatabasePool,
}

impl DbTenantRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantRepository for DbTenantRepository {
    async fn create(&self, input: CreateTenant) -> Result<Tenant> {
        sqlx::query_as::<_, Tenant>(
            r#"
            INSERT INTO tenants (id, name, slug, is_active, created_at)
            VALUES ($1, $2, $3, true, NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&input.name)
        .bind(&input.slug)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn get(&self, id: TenantId) -> Result<Option<Tenant>> {
        sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn list_active(&self) -> Result<Vec<Tenant>> {
        sqlx::query_as::<_, Tenant>(
            "SELECT * FROM tenants WHERE is_active = true ORDER BY created_at ASC",
        )
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }
}
