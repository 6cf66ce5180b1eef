//! In-process storage backend
//!
//! Implements every repository trait over a single mutex-guarded state, so
//! each operation is atomic in the same way the Postgres statements are.
//! Used by tests and by `database.backend = "memory"` for single-node runs;
//! nothing is persisted across restarts.

use crate::models::*;
use crate::repository::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_common::types::{
    CampaignId, CampaignItemId, ContactId, JobId, MessageId, SegmentId, SessionId, TagId,
    TenantId, TenantScope, WebhookLogId,
};
use parley_common::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct State {
    tenants: Vec<Tenant>,
    sessions: Vec<GatewaySession>,
    instance_index: HashMap<String, (TenantId, SessionId)>,
    contacts: Vec<Contact>,
    contact_tags: HashMap<ContactId, Vec<TagId>>,
    tags: Vec<Tag>,
    segments: Vec<Segment>,
    team: Vec<TeamMember>,
    campaigns: Vec<Campaign>,
    deleted_campaigns: HashSet<CampaignId>,
    items: Vec<CampaignItem>,
    webhook_logs: Vec<WebhookLog>,
    messages: Vec<Message>,
    jobs: Vec<Job>,
}

impl State {
    fn campaign_mut(&mut self, scope: TenantScope, id: CampaignId) -> Option<&mut Campaign> {
        let deleted = self.deleted_campaigns.contains(&id);
        self.campaigns
            .iter_mut()
            .find(|c| c.id == id && c.tenant_id == scope.tenant_id && !deleted)
    }

    fn item_mut(&mut self, scope: TenantScope, id: CampaignItemId) -> Option<&mut CampaignItem> {
        self.items
            .iter_mut()
            .find(|i| i.id == id && i.tenant_id == scope.tenant_id)
    }

    fn session_mut(&mut self, scope: TenantScope, id: SessionId) -> Option<&mut GatewaySession> {
        self.sessions
            .iter_mut()
            .find(|s| s.id == id && s.tenant_id == scope.tenant_id)
    }

    fn log_mut(&mut self, scope: TenantScope, id: WebhookLogId) -> Option<&mut WebhookLog> {
        self.webhook_logs
            .iter_mut()
            .find(|l| l.id == id && l.tenant_id == scope.tenant_id)
    }

    fn job_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    fn adjust_counters(&mut self, scope: TenantScope, id: CampaignId, plan: &TransitionPlan) {
        if let Some(campaign) = self.campaign_mut(scope, id) {
            campaign.sent_count += plan.sent_delta;
            campaign.delivered_count += plan.delivered_delta;
            campaign.read_count += plan.read_delta;
            campaign.failed_count += plan.failed_delta;
            campaign.updated_at = Utc::now();
        }
    }

    fn contact_is_eligible(contact: &Contact) -> bool {
        contact.messaging_consent
    }
}

fn new_job(
    queue: &str,
    payload: serde_json::Value,
    run_at: DateTime<Utc>,
    max_attempts: i32,
) -> Job {
    let now = Utc::now();
    Job {
        id: Uuid::now_v7(),
        queue: queue.to_string(),
        payload,
        status: JobStatus::Pending.as_str().to_string(),
        attempts: 0,
        max_attempts,
        run_at,
        locked_at: None,
        last_error: None,
        created_at: now,
        updated_at: now,
    }
}

/// Mutex-guarded in-memory store implementing every repository trait
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Repository bundle backed by this store
    pub fn repositories(&self) -> Repositories {
        Repositories {
            tenants: Arc::new(self.clone()),
            sessions: Arc::new(self.clone()),
            campaigns: Arc::new(self.clone()),
            items: Arc::new(self.clone()),
            contacts: Arc::new(self.clone()),
            webhook_logs: Arc::new(self.clone()),
            messages: Arc::new(self.clone()),
            jobs: Arc::new(self.clone()),
        }
    }

    /// Add a consenting contact to the directory
    pub fn insert_contact(&self, scope: TenantScope, name: &str, phone: &str) -> Contact {
        let contact = Contact {
            id: Uuid::now_v7(),
            tenant_id: scope.tenant_id,
            name: name.to_string(),
            phone: phone.to_string(),
            city: None,
            neighborhood: None,
            state: None,
            source: None,
            messaging_consent: true,
            created_at: Utc::now(),
        };
        self.state().contacts.push(contact.clone());
        contact
    }

    /// Replace a stored contact (matched by id)
    pub fn update_contact(&self, contact: Contact) {
        let mut state = self.state();
        if let Some(existing) = state.contacts.iter_mut().find(|c| c.id == contact.id) {
            *existing = contact;
        }
    }

    pub fn insert_tag(&self, scope: TenantScope, name: &str, system: Option<SystemTag>) -> Tag {
        let tag = Tag {
            id: Uuid::now_v7(),
            tenant_id: scope.tenant_id,
            name: name.to_string(),
            system_kind: system.map(|s| s.as_str().to_string()),
        };
        self.state().tags.push(tag.clone());
        tag
    }

    pub fn tag_contact(&self, contact_id: ContactId, tag_id: TagId) {
        let mut state = self.state();
        let tags = state.contact_tags.entry(contact_id).or_default();
        if !tags.contains(&tag_id) {
            tags.push(tag_id);
        }
    }

    pub fn insert_segment(&self, scope: TenantScope, name: &str, filter: &SegmentFilter) -> Segment {
        let segment = Segment {
            id: Uuid::now_v7(),
            tenant_id: scope.tenant_id,
            name: name.to_string(),
            filters: serde_json::to_value(filter).unwrap_or_default(),
        };
        self.state().segments.push(segment.clone());
        segment
    }

    pub fn insert_team_member(&self, scope: TenantScope, name: &str, phone: &str) -> TeamMember {
        let member = TeamMember {
            id: Uuid::now_v7(),
            tenant_id: scope.tenant_id,
            name: name.to_string(),
            phone: phone.to_string(),
            is_active: true,
        };
        self.state().team.push(member.clone());
        member
    }

    /// Drop an entry from the global instance index, leaving the session in place
    pub fn forget_instance(&self, instance_id: &str) {
        self.state().instance_index.remove(instance_id);
    }

    /// Number of webhook log entries across all tenants
    pub fn webhook_log_count(&self) -> usize {
        self.state().webhook_logs.len()
    }

    /// Snapshot of every job, in enqueue order
    pub fn jobs(&self) -> Vec<Job> {
        self.state().jobs.clone()
    }
}

#[async_trait]
impl TenantRepository for MemoryStore {
    async fn create(&self, input: CreateTenant) -> Result<Tenant> {
        let mut state = self.state();
        if state.tenants.iter().any(|t| t.slug == input.slug) {
            return Err(Error::Conflict(format!("duplicate tenant slug {}", input.slug)));
        }
        let tenant = Tenant {
            id: Uuid::now_v7(),
            name: input.name,
            slug: input.slug,
            is_active: true,
            created_at: Utc::now(),
        };
        state.tenants.push(tenant.clone());
        Ok(tenant)
    }

    async fn get(&self, id: TenantId) -> Result<Option<Tenant>> {
        Ok(self.state().tenants.iter().find(|t| t.id == id).cloned())
    }

    async fn list_active(&self) -> Result<Vec<Tenant>> {
        Ok(self
            .state()
            .tenants
            .iter()
            .filter(|t| t.is_active)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SessionRepository for MemoryStore {
    async fn create(&self, scope: TenantScope, input: CreateSession) -> Result<GatewaySession> {
        let mut state = self.state();
        if state.sessions.iter().any(|s| s.instance_id == input.instance_id)
            || state.instance_index.contains_key(&input.instance_id)
        {
            return Err(Error::Conflict(format!(
                "duplicate instance id {}",
                input.instance_id
            )));
        }

        let now = Utc::now();
        let session = GatewaySession {
            id: Uuid::now_v7(),
            tenant_id: scope.tenant_id,
            name: input.name,
            instance_id: input.instance_id.clone(),
            status: SessionStatus::Disconnected.to_string(),
            phone_number: None,
            access_token: input.access_token,
            webhook_secret: input.webhook_secret,
            daily_message_limit: input.daily_message_limit,
            messages_sent_today: 0,
            last_message_at: None,
            last_health_check: None,
            is_healthy: true,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        state
            .instance_index
            .insert(input.instance_id, (scope.tenant_id, session.id));
        state.sessions.push(session.clone());
        Ok(session)
    }

    async fn get(&self, scope: TenantScope, id: SessionId) -> Result<Option<GatewaySession>> {
        Ok(self.state().session_mut(scope, id).map(|s| s.clone()))
    }

    async fn find_active_by_instance(
        &self,
        scope: TenantScope,
        instance_id: &str,
    ) -> Result<Option<GatewaySession>> {
        Ok(self
            .state()
            .sessions
            .iter()
            .find(|s| {
                s.tenant_id == scope.tenant_id && s.instance_id == instance_id && s.is_active
            })
            .cloned())
    }

    async fn list_active(&self, scope: TenantScope) -> Result<Vec<GatewaySession>> {
        Ok(self
            .state()
            .sessions
            .iter()
            .filter(|s| s.tenant_id == scope.tenant_id && s.is_active)
            .cloned()
            .collect())
    }

    async fn lookup_tenant(&self, instance_id: &str) -> Result<Option<TenantId>> {
        Ok(self
            .state()
            .instance_index
            .get(instance_id)
            .map(|(tenant_id, _)| *tenant_id))
    }

    async fn index_instance(
        &self,
        instance_id: &str,
        tenant_id: TenantId,
        session_id: SessionId,
    ) -> Result<()> {
        self.state()
            .instance_index
            .insert(instance_id.to_string(), (tenant_id, session_id));
        Ok(())
    }

    async fn apply_connection(
        &self,
        scope: TenantScope,
        id: SessionId,
        change: &ConnectionChange,
    ) -> Result<()> {
        let mut state = self.state();
        if let Some(session) = state.session_mut(scope, id) {
            let now = Utc::now();
            session.status = change.status.to_string();
            if let Some(healthy) = change.is_healthy {
                session.is_healthy = healthy;
                session.last_health_check = Some(now);
            }
            match &change.phone {
                PhoneUpdate::Keep => {}
                PhoneUpdate::Set(phone) => session.phone_number = Some(phone.clone()),
                PhoneUpdate::Clear => session.phone_number = None,
            }
            session.updated_at = now;
        }
        Ok(())
    }

    async fn record_health(&self, scope: TenantScope, id: SessionId, healthy: bool) -> Result<()> {
        let mut state = self.state();
        if let Some(session) = state.session_mut(scope, id) {
            session.is_healthy = healthy;
            session.last_health_check = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_send(&self, scope: TenantScope, id: SessionId) -> Result<()> {
        let mut state = self.state();
        if let Some(session) = state.session_mut(scope, id) {
            session.messages_sent_today += 1;
            session.last_message_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn reset_daily_counters(
        &self,
        scope: TenantScope,
        day_start: DateTime<Utc>,
    ) -> Result<u64> {
        let mut state = self.state();
        let mut reset = 0;
        for session in state.sessions.iter_mut().filter(|s| {
            s.tenant_id == scope.tenant_id
                && s.messages_sent_today != 0
                && s.last_message_at.map_or(true, |at| at < day_start)
        }) {
            session.messages_sent_today = 0;
            reset += 1;
        }
        Ok(reset)
    }

    async fn deactivate(&self, scope: TenantScope, id: SessionId) -> Result<bool> {
        let mut state = self.state();
        match state.session_mut(scope, id) {
            Some(session) if session.is_active => {
                session.is_active = false;
                session.status = SessionStatus::Disconnected.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl CampaignRepository for MemoryStore {
    async fn create(&self, scope: TenantScope, input: CreateCampaign) -> Result<Campaign> {
        let now = Utc::now();
        let campaign = Campaign {
            id: Uuid::now_v7(),
            tenant_id: scope.tenant_id,
            session_id: input.session_id,
            name: input.name,
            message: input.message,
            media_url: input.media_url,
            media_type: input.media_type,
            target: serde_json::to_value(&input.target)
                .map_err(|e| Error::Validation(format!("Invalid targeting rule: {}", e)))?,
            scheduled_at: None,
            status: CampaignStatus::Draft.to_string(),
            total_recipients: 0,
            sent_count: 0,
            delivered_count: 0,
            read_count: 0,
            failed_count: 0,
            created_by: input.created_by,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.state().campaigns.push(campaign.clone());
        Ok(campaign)
    }

    async fn get(&self, scope: TenantScope, id: CampaignId) -> Result<Option<Campaign>> {
        Ok(self.state().campaign_mut(scope, id).map(|c| c.clone()))
    }

    async fn status(&self, scope: TenantScope, id: CampaignId) -> Result<Option<CampaignStatus>> {
        self.state()
            .campaign_mut(scope, id)
            .map(|c| c.status.parse().map_err(Error::Database))
            .transpose()
    }

    async fn list_due_scheduled(
        &self,
        scope: TenantScope,
        now: DateTime<Utc>,
    ) -> Result<Vec<Campaign>> {
        let state = self.state();
        Ok(state
            .campaigns
            .iter()
            .filter(|c| {
                c.tenant_id == scope.tenant_id
                    && !state.deleted_campaigns.contains(&c.id)
                    && c.status_enum() == Some(CampaignStatus::Scheduled)
                    && c.scheduled_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect())
    }

    async fn list_running_with_pending(&self, scope: TenantScope) -> Result<Vec<CampaignId>> {
        let state = self.state();
        Ok(state
            .campaigns
            .iter()
            .filter(|c| {
                c.tenant_id == scope.tenant_id
                    && !state.deleted_campaigns.contains(&c.id)
                    && c.status_enum() == Some(CampaignStatus::Running)
                    && state.items.iter().any(|i| {
                        i.campaign_id == c.id && i.status_enum() == Some(ItemStatus::Pending)
                    })
            })
            .map(|c| c.id)
            .collect())
    }

    async fn populate_and_start(
        &self,
        scope: TenantScope,
        id: CampaignId,
        items: Vec<NewCampaignItem>,
    ) -> Result<Option<Campaign>> {
        let mut state = self.state();
        let populatable = matches!(
            state.campaign_mut(scope, id).and_then(|c| c.status_enum()),
            Some(CampaignStatus::Draft | CampaignStatus::Scheduled)
        );
        if !populatable {
            return Ok(None);
        }

        let now = Utc::now();
        let mut phones: HashSet<String> = state
            .items
            .iter()
            .filter(|i| i.campaign_id == id)
            .map(|i| i.recipient_phone.clone())
            .collect();
        let mut inserted = 0;
        for item in items {
            if !phones.insert(item.recipient_phone.clone()) {
                continue;
            }
            state.items.push(CampaignItem {
                id: Uuid::now_v7(),
                tenant_id: scope.tenant_id,
                campaign_id: id,
                contact_id: item.contact_id,
                recipient_name: item.recipient_name,
                recipient_phone: item.recipient_phone,
                substitutions: item.substitutions,
                status: ItemStatus::Pending.to_string(),
                message_id: None,
                error_message: None,
                claimed_at: None,
                sent_at: None,
                delivered_at: None,
                read_at: None,
                created_at: now,
                updated_at: now,
            });
            inserted += 1;
        }

        let campaign = state
            .campaign_mut(scope, id)
            .ok_or_else(|| Error::NotFound(format!("campaign {}", id)))?;
        campaign.status = CampaignStatus::Running.to_string();
        campaign.total_recipients = inserted;
        campaign.started_at.get_or_insert(now);
        campaign.completed_at = None;
        campaign.updated_at = now;
        Ok(Some(campaign.clone()))
    }

    async fn transition(
        &self,
        scope: TenantScope,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<Option<Campaign>> {
        let mut state = self.state();
        let Some(campaign) = state.campaign_mut(scope, id) else {
            return Ok(None);
        };
        if !campaign.status_enum().is_some_and(|s| from.contains(&s)) {
            return Ok(None);
        }

        let now = Utc::now();
        campaign.status = to.to_string();
        match to {
            CampaignStatus::Running => {
                campaign.started_at.get_or_insert(now);
                campaign.completed_at = None;
            }
            CampaignStatus::Completed | CampaignStatus::Cancelled | CampaignStatus::Failed => {
                campaign.completed_at = Some(now);
            }
            _ => {}
        }
        campaign.updated_at = now;
        Ok(Some(campaign.clone()))
    }

    async fn schedule(
        &self,
        scope: TenantScope,
        id: CampaignId,
        at: DateTime<Utc>,
    ) -> Result<Option<Campaign>> {
        let mut state = self.state();
        match state.campaign_mut(scope, id) {
            Some(campaign) if campaign.status_enum() == Some(CampaignStatus::Draft) => {
                campaign.status = CampaignStatus::Scheduled.to_string();
                campaign.scheduled_at = Some(at);
                campaign.updated_at = Utc::now();
                Ok(Some(campaign.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn complete_if_drained(&self, scope: TenantScope, id: CampaignId) -> Result<bool> {
        let mut state = self.state();
        let unfinished = state.items.iter().any(|i| {
            i.campaign_id == id
                && matches!(
                    i.status_enum(),
                    Some(ItemStatus::Pending | ItemStatus::Queued)
                )
        });
        if unfinished {
            return Ok(false);
        }

        match state.campaign_mut(scope, id) {
            Some(campaign) if campaign.status_enum() == Some(CampaignStatus::Running) => {
                let now = Utc::now();
                campaign.status = CampaignStatus::Completed.to_string();
                campaign.completed_at = Some(now);
                campaign.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn aggregate_counters(
        &self,
        scope: TenantScope,
        id: CampaignId,
    ) -> Result<CampaignCounters> {
        let state = self.state();
        let mut counters = CampaignCounters::default();
        for item in state
            .items
            .iter()
            .filter(|i| i.campaign_id == id && i.tenant_id == scope.tenant_id)
        {
            let status = item.status_enum();
            counters.total_recipients += 1;
            if status.is_some_and(|s| s.counts_as_sent()) {
                counters.sent += 1;
            }
            if status == Some(ItemStatus::Failed) {
                counters.failed += 1;
            }
            if item.delivered_at.is_some() {
                counters.delivered += 1;
            }
            if item.read_at.is_some() {
                counters.read += 1;
            }
        }
        Ok(counters)
    }

    async fn overwrite_counters(
        &self,
        scope: TenantScope,
        id: CampaignId,
        counters: &CampaignCounters,
    ) -> Result<()> {
        let mut state = self.state();
        if let Some(campaign) = state.campaign_mut(scope, id) {
            campaign.total_recipients = counters.total_recipients;
            campaign.sent_count = counters.sent;
            campaign.delivered_count = counters.delivered;
            campaign.read_count = counters.read;
            campaign.failed_count = counters.failed;
            campaign.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn soft_delete(&self, scope: TenantScope, id: CampaignId) -> Result<bool> {
        let mut state = self.state();
        let deletable = state
            .campaign_mut(scope, id)
            .is_some_and(|c| c.status_enum() != Some(CampaignStatus::Running));
        if deletable {
            state.deleted_campaigns.insert(id);
        }
        Ok(deletable)
    }
}

#[async_trait]
impl CampaignItemRepository for MemoryStore {
    async fn list(&self, scope: TenantScope, campaign_id: CampaignId) -> Result<Vec<CampaignItem>> {
        Ok(self
            .state()
            .items
            .iter()
            .filter(|i| i.campaign_id == campaign_id && i.tenant_id == scope.tenant_id)
            .cloned()
            .collect())
    }

    async fn claim_pending(
        &self,
        scope: TenantScope,
        campaign_id: CampaignId,
        limit: i64,
    ) -> Result<Vec<CampaignItem>> {
        let mut state = self.state();
        let now = Utc::now();
        let limit = usize::try_from(limit).unwrap_or(0);

        let claimed = state
            .items
            .iter_mut()
            .filter(|i| {
                i.campaign_id == campaign_id
                    && i.tenant_id == scope.tenant_id
                    && i.status_enum() == Some(ItemStatus::Pending)
            })
            .take(limit)
            .map(|item| {
                item.status = ItemStatus::Queued.to_string();
                item.claimed_at = Some(now);
                item.updated_at = now;
                item.clone()
            })
            .collect();
        Ok(claimed)
    }

    async fn count_unfinished(
        &self,
        scope: TenantScope,
        campaign_id: CampaignId,
    ) -> Result<UnfinishedCounts> {
        let state = self.state();
        let mut counts = UnfinishedCounts::default();
        for item in state
            .items
            .iter()
            .filter(|i| i.campaign_id == campaign_id && i.tenant_id == scope.tenant_id)
        {
            match item.status_enum() {
                Some(ItemStatus::Pending) => counts.pending += 1,
                Some(ItemStatus::Queued) => counts.queued += 1,
                _ => {}
            }
        }
        Ok(counts)
    }

    async fn record_sent(
        &self,
        scope: TenantScope,
        id: CampaignItemId,
        message_id: Option<&str>,
    ) -> Result<bool> {
        let mut state = self.state();
        let now = Utc::now();
        let campaign_id = match state.item_mut(scope, id) {
            Some(item) if item.status_enum() == Some(ItemStatus::Queued) => {
                item.status = ItemStatus::Sent.to_string();
                item.sent_at = Some(now);
                item.message_id = message_id.map(str::to_string);
                item.error_message = None;
                item.updated_at = now;
                item.campaign_id
            }
            _ => return Ok(false),
        };
        if let Some(campaign) = state.campaign_mut(scope, campaign_id) {
            campaign.sent_count += 1;
            campaign.updated_at = now;
        }
        Ok(true)
    }

    async fn record_failed(
        &self,
        scope: TenantScope,
        id: CampaignItemId,
        error: &str,
    ) -> Result<bool> {
        let mut state = self.state();
        let now = Utc::now();
        let campaign_id = match state.item_mut(scope, id) {
            Some(item) if item.status_enum() == Some(ItemStatus::Queued) => {
                item.status = ItemStatus::Failed.to_string();
                item.error_message = Some(error.to_string());
                item.updated_at = now;
                item.campaign_id
            }
            _ => return Ok(false),
        };
        if let Some(campaign) = state.campaign_mut(scope, campaign_id) {
            campaign.failed_count += 1;
            campaign.updated_at = now;
        }
        Ok(true)
    }

    async fn release(&self, scope: TenantScope, ids: &[CampaignItemId]) -> Result<u64> {
        let mut state = self.state();
        let mut released = 0;
        for item in state.items.iter_mut().filter(|i| {
            i.tenant_id == scope.tenant_id
                && ids.contains(&i.id)
                && i.status_enum() == Some(ItemStatus::Queued)
        }) {
            item.status = ItemStatus::Pending.to_string();
            item.claimed_at = None;
            released += 1;
        }
        Ok(released)
    }

    async fn requeue_stale(
        &self,
        scope: TenantScope,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<CampaignId>> {
        let mut state = self.state();
        let mut campaigns = Vec::new();
        for item in state.items.iter_mut().filter(|i| {
            i.tenant_id == scope.tenant_id
                && i.status_enum() == Some(ItemStatus::Queued)
                && i.claimed_at.is_some_and(|at| at < claimed_before)
        }) {
            item.status = ItemStatus::Pending.to_string();
            item.claimed_at = None;
            if !campaigns.contains(&item.campaign_id) {
                campaigns.push(item.campaign_id);
            }
        }
        Ok(campaigns)
    }

    async fn find_by_message_id(
        &self,
        scope: TenantScope,
        message_id: &str,
    ) -> Result<Option<CampaignItem>> {
        Ok(self
            .state()
            .items
            .iter()
            .rev()
            .find(|i| i.tenant_id == scope.tenant_id && i.message_id.as_deref() == Some(message_id))
            .cloned())
    }

    async fn apply_delivery_status(
        &self,
        scope: TenantScope,
        id: CampaignItemId,
        status: &DeliveryStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state();
        let Some(item) = state.item_mut(scope, id) else {
            return Ok(false);
        };
        let current: ItemStatus = item.status.parse().map_err(Error::Database)?;
        let Some(plan) = plan_delivery_transition(
            current,
            item.delivered_at.is_some(),
            item.read_at.is_some(),
            status,
        ) else {
            return Ok(false);
        };

        item.status = plan.to.to_string();
        if plan.stamp_claimed {
            item.claimed_at.get_or_insert_with(Utc::now);
        }
        if plan.stamp_sent {
            item.sent_at.get_or_insert(at);
        }
        if plan.stamp_delivered {
            item.delivered_at = Some(at);
        }
        if plan.stamp_read {
            item.read_at = Some(at);
        }
        if let Some(error) = &plan.error {
            item.error_message = Some(error.clone());
        }
        item.updated_at = Utc::now();
        let campaign_id = item.campaign_id;

        state.adjust_counters(scope, campaign_id, &plan);
        Ok(true)
    }
}

#[async_trait]
impl ContactDirectory for MemoryStore {
    async fn consented_with_any_tag(
        &self,
        scope: TenantScope,
        tag_ids: &[TagId],
    ) -> Result<Vec<Contact>> {
        let state = self.state();
        Ok(state
            .contacts
            .iter()
            .filter(|c| c.tenant_id == scope.tenant_id && State::contact_is_eligible(c))
            .filter(|c| {
                state
                    .contact_tags
                    .get(&c.id)
                    .is_some_and(|tags| tags.iter().any(|t| tag_ids.contains(t)))
            })
            .cloned()
            .collect())
    }

    async fn system_tag(&self, scope: TenantScope, kind: SystemTag) -> Result<Option<Tag>> {
        Ok(self
            .state()
            .tags
            .iter()
            .find(|t| {
                t.tenant_id == scope.tenant_id && t.system_kind.as_deref() == Some(kind.as_str())
            })
            .cloned())
    }

    async fn segment(&self, scope: TenantScope, id: SegmentId) -> Result<Option<Segment>> {
        Ok(self
            .state()
            .segments
            .iter()
            .find(|s| s.id == id && s.tenant_id == scope.tenant_id)
            .cloned())
    }

    async fn consented_matching(
        &self,
        scope: TenantScope,
        filter: &SegmentFilter,
    ) -> Result<Vec<Contact>> {
        let state = self.state();
        Ok(state
            .contacts
            .iter()
            .filter(|c| c.tenant_id == scope.tenant_id && State::contact_is_eligible(c))
            .filter(|c| {
                let tags = state
                    .contact_tags
                    .get(&c.id)
                    .map(Vec::as_slice)
                    .unwrap_or(&[]);
                filter.matches(c, tags)
            })
            .cloned()
            .collect())
    }

    async fn active_team_members(&self, scope: TenantScope) -> Result<Vec<TeamMember>> {
        Ok(self
            .state()
            .team
            .iter()
            .filter(|m| m.tenant_id == scope.tenant_id && m.is_active)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WebhookLogRepository for MemoryStore {
    async fn create(&self, scope: TenantScope, input: CreateWebhookLog) -> Result<WebhookLog> {
        let log = WebhookLog {
            id: Uuid::now_v7(),
            tenant_id: scope.tenant_id,
            session_id: input.session_id,
            event_type: input.event_type,
            payload: input.payload,
            processed: false,
            processed_at: None,
            error: None,
            attempts: 0,
            locked_at: None,
            created_at: Utc::now(),
        };
        self.state().webhook_logs.push(log.clone());
        Ok(log)
    }

    async fn get(&self, scope: TenantScope, id: WebhookLogId) -> Result<Option<WebhookLog>> {
        Ok(self.state().log_mut(scope, id).map(|l| l.clone()))
    }

    async fn begin_processing(
        &self,
        scope: TenantScope,
        id: WebhookLogId,
        lease_cutoff: DateTime<Utc>,
    ) -> Result<Option<WebhookLog>> {
        let mut state = self.state();
        match state.log_mut(scope, id) {
            Some(log)
                if !log.processed && log.locked_at.map_or(true, |at| at < lease_cutoff) =>
            {
                log.locked_at = Some(Utc::now());
                log.attempts += 1;
                Ok(Some(log.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_processed(
        &self,
        scope: TenantScope,
        id: WebhookLogId,
        note: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state();
        if let Some(log) = state.log_mut(scope, id) {
            log.processed = true;
            log.processed_at = Some(Utc::now());
            log.locked_at = None;
            log.error = note.map(str::to_string);
        }
        Ok(())
    }

    async fn record_error(&self, scope: TenantScope, id: WebhookLogId, error: &str) -> Result<()> {
        let mut state = self.state();
        if let Some(log) = state.log_mut(scope, id).filter(|l| !l.processed) {
            log.error = Some(error.to_string());
            log.locked_at = None;
        }
        Ok(())
    }

    async fn list_unprocessed(
        &self,
        scope: TenantScope,
        filter: &UnprocessedFilter,
    ) -> Result<Vec<WebhookLogId>> {
        Ok(self
            .state()
            .webhook_logs
            .iter()
            .filter(|l| {
                l.tenant_id == scope.tenant_id
                    && !l.processed
                    && l.created_at < filter.created_before
                    && l.locked_at.map_or(true, |at| at < filter.lease_cutoff)
                    && l.attempts < filter.max_attempts
            })
            .take(usize::try_from(filter.limit).unwrap_or(0))
            .map(|l| l.id)
            .collect())
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn create(&self, scope: TenantScope, input: CreateMessage) -> Result<Message> {
        let now = Utc::now();
        let message = Message {
            id: Uuid::now_v7(),
            tenant_id: scope.tenant_id,
            session_id: input.session_id,
            phone: input.phone,
            content: input.content,
            status: ItemStatus::Pending.to_string(),
            external_id: input.external_id,
            gateway_message_id: input.gateway_message_id,
            error_message: None,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            failed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.state().messages.push(message.clone());
        Ok(message)
    }

    async fn find_by_gateway_id(&self, scope: TenantScope, id: &str) -> Result<Option<Message>> {
        let state = self.state();
        let in_tenant = |m: &&Message| m.tenant_id == scope.tenant_id;
        let by_gateway = state
            .messages
            .iter()
            .filter(in_tenant)
            .find(|m| m.gateway_message_id.as_deref() == Some(id));
        let by_external = || {
            state
                .messages
                .iter()
                .filter(in_tenant)
                .find(|m| m.external_id.as_deref() == Some(id))
        };
        Ok(by_gateway.or_else(by_external).cloned())
    }

    async fn apply_delivery_status(
        &self,
        scope: TenantScope,
        id: MessageId,
        status: &DeliveryStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state();
        let Some(message) = state
            .messages
            .iter_mut()
            .find(|m| m.id == id && m.tenant_id == scope.tenant_id)
        else {
            return Ok(false);
        };
        let current: ItemStatus = message.status.parse().map_err(Error::Database)?;
        let Some(plan) = plan_delivery_transition(
            current,
            message.delivered_at.is_some(),
            message.read_at.is_some(),
            status,
        ) else {
            return Ok(false);
        };

        message.status = plan.to.to_string();
        if plan.stamp_sent {
            message.sent_at.get_or_insert(at);
        }
        if plan.stamp_delivered {
            message.delivered_at = Some(at);
        }
        if plan.stamp_read {
            message.read_at = Some(at);
        }
        if plan.to == ItemStatus::Failed {
            message.failed_at = Some(at);
        }
        if let Some(error) = plan.error {
            message.error_message = Some(error);
        }
        message.updated_at = Utc::now();
        Ok(true)
    }

    async fn attach_gateway_id(
        &self,
        scope: TenantScope,
        external_id: &str,
        gateway_id: &str,
    ) -> Result<u64> {
        let mut state = self.state();
        let mut attached = 0;
        for message in state.messages.iter_mut().filter(|m| {
            m.tenant_id == scope.tenant_id
                && m.external_id.as_deref() == Some(external_id)
                && m.gateway_message_id.as_deref() != Some(gateway_id)
        }) {
            message.gateway_message_id = Some(gateway_id.to_string());
            attached += 1;
        }
        Ok(attached)
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        run_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<JobId> {
        let job = new_job(queue, payload, run_at, max_attempts);
        let id = job.id;
        self.state().jobs.push(job);
        Ok(id)
    }

    async fn enqueue_if_absent(
        &self,
        queue: &str,
        payload: serde_json::Value,
        run_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<Option<JobId>> {
        let mut state = self.state();
        let live = state.jobs.iter().any(|j| {
            j.queue == queue
                && j.payload == payload
                && (j.status == JobStatus::Pending.as_str()
                    || j.status == JobStatus::Running.as_str())
        });
        if live {
            return Ok(None);
        }
        let job = new_job(queue, payload, run_at, max_attempts);
        let id = job.id;
        state.jobs.push(job);
        Ok(Some(id))
    }

    async fn claim_next(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut state = self.state();
        let next = state
            .jobs
            .iter_mut()
            .filter(|j| {
                j.queue == queue && j.status == JobStatus::Pending.as_str() && j.run_at <= now
            })
            .min_by_key(|j| j.run_at);

        Ok(next.map(|job| {
            job.status = JobStatus::Running.as_str().to_string();
            job.locked_at = Some(Utc::now());
            job.attempts += 1;
            job.clone()
        }))
    }

    async fn complete(&self, id: JobId) -> Result<()> {
        if let Some(job) = self.state().job_mut(id) {
            job.status = JobStatus::Completed.as_str().to_string();
            job.locked_at = None;
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn retry(&self, id: JobId, error: &str, run_at: DateTime<Utc>) -> Result<()> {
        if let Some(job) = self.state().job_mut(id) {
            job.status = JobStatus::Pending.as_str().to_string();
            job.run_at = run_at;
            job.last_error = Some(error.to_string());
            job.locked_at = None;
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<()> {
        if let Some(job) = self.state().job_mut(id) {
            job.status = JobStatus::Failed.as_str().to_string();
            job.last_error = Some(error.to_string());
            job.locked_at = None;
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn requeue_stale(&self, locked_before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state();
        let mut requeued = 0;
        for job in state.jobs.iter_mut().filter(|j| {
            j.status == JobStatus::Running.as_str()
                && j.locked_at.is_some_and(|at| at < locked_before)
        }) {
            job.status = JobStatus::Pending.as_str().to_string();
            job.locked_at = None;
            requeued += 1;
        }
        Ok(requeued)
    }

    async fn purge_completed(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state();
        let len = state.jobs.len();
        state
            .jobs
            .retain(|j| !(j.status == JobStatus::Completed.as_str() && j.updated_at < before));
        Ok((len - state.jobs.len()) as u64)
    }
}
