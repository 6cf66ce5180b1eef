//! Read-only view of the tenant contact directory
//!
//! Directory management (imports, tagging, segment editing) lives outside
//! this system; campaigns only query it when resolving recipients.

use crate::db::{db_err, DatabasePool};
use crate::models::{Contact, Segment, SegmentFilter, SystemTag, Tag, TeamMember};
use async_trait::async_trait;
use parley_common::types::{SegmentId, TagId, TenantScope};
use parley_common::Result;
use sqlx::{Postgres, QueryBuilder};

/// Contact directory trait
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    /// Consenting contacts carrying at least one of `tag_ids`
    async fn consented_with_any_tag(
        &self,
        scope: TenantScope,
        tag_ids: &[TagId],
    ) -> Result<Vec<Contact>>;
    async fn system_tag(&self, scope: TenantScope, kind: SystemTag) -> Result<Option<Tag>>;
    async fn segment(&self, scope: TenantScope, id: SegmentId) -> Result<Option<Segment>>;
    /// Consenting contacts matching a saved segment filter
    async fn consented_matching(
        &self,
        scope: TenantScope,
        filter: &SegmentFilter,
    ) -> Result<Vec<Contact>>;
    async fn active_team_members(&self, scope: TenantScope) -> Result<Vec<TeamMember>>;
}

/// Database contact directory
pub struct DbContactDirectory {
    pool: DatabasePool,
}

impl DbContactDirectory {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContactDirectory for DbContactDirectory {
    async fn consented_with_any_tag(
        &self,
        scope: TenantScope,
        tag_ids: &[TagId],
    ) -> Result<Vec<Contact>> {
        if tag_ids.is_empty() {
            return Ok(Vec::new());
        }

        sqlx::query_as::<_, Contact>(
            r#"
            SELECT c.id, c.tenant_id, c.name, c.phone, c.city, c.neighborhood, c.state,
                   c.source, c.messaging_consent, c.created_at
            FROM contacts c
            WHERE c.tenant_id = $1
              AND c.messaging_consent = true
              AND c.deleted_at IS NULL
              AND EXISTS (
                  SELECT 1 FROM contact_tags ct
                  WHERE ct.contact_id = c.id AND ct.tag_id = ANY($2)
              )
            ORDER BY c.created_at ASC
            "#,
        )
        .bind(scope.tenant_id)
        .bind(tag_ids)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn system_tag(&self, scope: TenantScope, kind: SystemTag) -> Result<Option<Tag>> {
        sqlx::query_as::<_, Tag>(
            r#"
            SELECT id, tenant_id, name, system_kind FROM tags
            WHERE tenant_id = $1 AND system_kind = $2
            "#,
        )
        .bind(scope.tenant_id)
        .bind(kind.as_str())
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn segment(&self, scope: TenantScope, id: SegmentId) -> Result<Option<Segment>> {
        sqlx::query_as::<_, Segment>(
            "SELECT id, tenant_id, name, filters FROM segments WHERE id = $1 AND tenant_id = $2",
        )
        .bind(id)
        .bind(scope.tenant_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn consented_matching(
        &self,
        scope: TenantScope,
        filter: &SegmentFilter,
    ) -> Result<Vec<Contact>> {
        let mut query: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT c.id, c.tenant_id, c.name, c.phone, c.city, c.neighborhood, c.state, \
             c.source, c.messaging_consent, c.created_at \
             FROM contacts c \
             WHERE c.messaging_consent = true AND c.deleted_at IS NULL AND c.tenant_id = ",
        );
        query.push_bind(scope.tenant_id);

        if let Some(city) = &filter.city {
            query.push(" AND LOWER(c.city) = LOWER(").push_bind(city).push(")");
        }
        if let Some(state) = &filter.state {
            query.push(" AND LOWER(c.state) = LOWER(").push_bind(state).push(")");
        }
        if let Some(neighborhood) = &filter.neighborhood {
            query
                .push(" AND c.neighborhood ILIKE ")
                .push_bind(format!("%{}%", neighborhood));
        }
        if let Some(source) = &filter.source {
            query.push(" AND c.source = ").push_bind(source);
        }
        if !filter.tags.is_empty() {
            query
                .push(
                    " AND EXISTS (SELECT 1 FROM contact_tags ct \
                     WHERE ct.contact_id = c.id AND ct.tag_id = ANY(",
                )
                .push_bind(&filter.tags)
                .push("))");
        }
        if !filter.tags_all.is_empty() {
            query
                .push(
                    " AND (SELECT COUNT(DISTINCT ct.tag_id) FROM contact_tags ct \
                     WHERE ct.contact_id = c.id AND ct.tag_id = ANY(",
                )
                .push_bind(&filter.tags_all)
                .push(")) = ")
                .push_bind(filter.tags_all.len() as i64);
        }
        query.push(" ORDER BY c.created_at ASC");

        query
            .build_query_as::<Contact>()
            .fetch_all(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn active_team_members(&self, scope: TenantScope) -> Result<Vec<TeamMember>> {
        sqlx::query_as::<_, TeamMember>(
            r#"
            SELECT id, tenant_id, name, phone, is_active FROM team_members
            WHERE tenant_id = $1 AND is_active = true
            ORDER BY created_at ASC
            "#,
        )
        .bind(scope.tenant_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }
}
