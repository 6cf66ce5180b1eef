//! Shared handler state

use parley_core::{CampaignManager, SessionManager, WebhookIngestor};
use parley_storage::repository::Repositories;
use std::sync::Arc;

/// Everything a handler can reach
#[derive(Clone)]
pub struct AppState {
    pub repos: Repositories,
    pub campaigns: Arc<CampaignManager>,
    pub ingestor: Arc<WebhookIngestor>,
    pub sessions: Arc<SessionManager>,
}
