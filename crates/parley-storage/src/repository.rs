//! Repository layer for data access

pub mod campaign_items;
pub mod campaigns;
pub mod contacts;
pub mod jobs;
pub mod messages;
pub mod sessions;
pub mod tenants;
pub mod webhook_logs;

use crate::db::DatabasePool;
use std::sync::Arc;

pub use campaign_items::{CampaignItemRepository, DbCampaignItemRepository, NewCampaignItem};
pub use campaigns::{CampaignRepository, CreateCampaign, DbCampaignRepository};
pub use contacts::{ContactDirectory, DbContactDirectory};
pub use jobs::{DbJobRepository, JobRepository};
pub use messages::{CreateMessage, DbMessageRepository, MessageRepository};
pub use sessions::{CreateSession, DbSessionRepository, SessionRepository};
pub use tenants::{CreateTenant, DbTenantRepository, TenantRepository};
pub use webhook_logs::{
    CreateWebhookLog, DbWebhookLogRepository, UnprocessedFilter, WebhookLogRepository,
};

/// Every repository the core needs, behind trait objects
#[derive(Clone)]
pub struct Repositories {
    pub tenants: Arc<dyn TenantRepository>,
    pub sessions: Arc<dyn SessionRepository>,
    pub campaigns: Arc<dyn CampaignRepository>,
    pub items: Arc<dyn CampaignItemRepository>,
    pub contacts: Arc<dyn ContactDirectory>,
    pub webhook_logs: Arc<dyn WebhookLogRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub jobs: Arc<dyn JobRepository>,
}

impl Repositories {
    /// Postgres-backed repositories sharing one pool
    pub fn postgres(pool: &DatabasePool) -> Self {
        Self {
            tenants: Arc::new(DbTenantRepository::new(pool.clone())),
            sessions: Arc::new(DbSessionRepository::new(pool.clone())),
            campaigns: Arc::new(DbCampaignRepository::new(pool.clone())),
            items: Arc::new(DbCampaignItemRepository::new(pool.clone())),
            contacts: Arc::new(DbContactDirectory::new(pool.clone())),
            webhook_logs: Arc::new(DbWebhookLogRepository::new(pool.clone())),
            messages: Arc::new(DbMessageRepository::new(pool.clone())),
            jobs: Arc::new(DbJobRepository::new(pool.clone())),
        }
    }
}
