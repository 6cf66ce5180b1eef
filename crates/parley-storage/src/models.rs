//! Database models

use chrono::{DateTime, Utc};
use parley_common::types::{
    CampaignId, CampaignItemId, ContactId, JobId, MediaType, MessageId, SegmentId, SessionId,
    TagId, TenantId, WebhookLogId,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Tenant model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub slug: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Gateway session connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
    Banned,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Disconnected => write!(f, "disconnected"),
            SessionStatus::Connecting => write!(f, "connecting"),
            SessionStatus::Connected => write!(f, "connected"),
            SessionStatus::Banned => write!(f, "banned"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disconnected" => Ok(SessionStatus::Disconnected),
            "connecting" => Ok(SessionStatus::Connecting),
            "connected" => Ok(SessionStatus::Connected),
            "banned" => Ok(SessionStatus::Banned),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

/// Gateway session model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct GatewaySession {
    pub id: SessionId,
    pub tenant_id: TenantId,
    pub name: String,
    pub instance_id: String,
    pub status: String,
    pub phone_number: Option<String>,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    #[serde(skip_serializing)]
    pub webhook_secret: String,
    pub daily_message_limit: i32,
    pub messages_sent_today: i32,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub is_healthy: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GatewaySession {
    /// Get status enum
    pub fn status_enum(&self) -> Option<SessionStatus> {
        self.status.parse().ok()
    }

    /// Messages still allowed today under the daily quota
    pub fn remaining_messages_today(&self) -> i32 {
        (self.daily_message_limit - self.messages_sent_today).max(0)
    }

    pub fn is_connected(&self) -> bool {
        self.status_enum() == Some(SessionStatus::Connected)
    }
}

/// How a connection change affects the stored phone number
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhoneUpdate {
    Keep,
    Set(String),
    Clear,
}

/// A connection-state change applied to a gateway session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionChange {
    pub status: SessionStatus,
    pub is_healthy: Option<bool>,
    pub phone: PhoneUpdate,
}

/// Directory contact
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub tenant_id: TenantId,
    pub name: String,
    pub phone: String,
    pub city: Option<String>,
    pub neighborhood: Option<String>,
    pub state: Option<String>,
    pub source: Option<String>,
    pub messaging_consent: bool,
    pub created_at: DateTime<Utc>,
}

impl Contact {
    pub fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or("")
    }
}

/// System tags backing the fixed targeting groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemTag {
    Lead,
    Supporter,
}

impl SystemTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemTag::Lead => "lead",
            SystemTag::Supporter => "supporter",
        }
    }
}

/// Contact tag
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Tag {
    pub id: TagId,
    pub tenant_id: TenantId,
    pub name: String,
    pub system_kind: Option<String>,
}

/// Saved segment
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    pub tenant_id: TenantId,
    pub name: String,
    pub filters: serde_json::Value,
}

impl Segment {
    /// Parse the stored filter; unknown keys are ignored
    pub fn filter(&self) -> SegmentFilter {
        serde_json::from_value(self.filters.clone()).unwrap_or_default()
    }
}

/// Saved segment filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentFilter {
    /// Case-insensitive exact match
    pub city: Option<String>,
    /// Case-insensitive exact match
    pub state: Option<String>,
    /// Case-insensitive substring match
    pub neighborhood: Option<String>,
    pub source: Option<String>,
    /// Contact must carry at least one of these tags
    pub tags: Vec<TagId>,
    /// Contact must carry all of these tags
    pub tags_all: Vec<TagId>,
}

impl SegmentFilter {
    /// Evaluate the filter against one contact and its tags
    pub fn matches(&self, contact: &Contact, contact_tags: &[TagId]) -> bool {
        fn eq_ci(value: &Option<String>, wanted: &str) -> bool {
            value
                .as_deref()
                .map(|v| v.eq_ignore_ascii_case(wanted))
                .unwrap_or(false)
        }

        if let Some(city) = &self.city {
            if !eq_ci(&contact.city, city) {
                return false;
            }
        }
        if let Some(state) = &self.state {
            if !eq_ci(&contact.state, state) {
                return false;
            }
        }
        if let Some(neighborhood) = &self.neighborhood {
            let needle = neighborhood.to_lowercase();
            let found = contact
                .neighborhood
                .as_deref()
                .map(|n| n.to_lowercase().contains(&needle))
                .unwrap_or(false);
            if !found {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if contact.source.as_deref() != Some(source.as_str()) {
                return false;
            }
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| contact_tags.contains(t)) {
            return false;
        }
        self.tags_all.iter().all(|t| contact_tags.contains(t))
    }
}

/// Active member of a tenant's internal team
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TeamMember {
    pub id: uuid::Uuid,
    pub tenant_id: TenantId,
    pub name: String,
    pub phone: String,
    pub is_active: bool,
}

/// Campaign status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Running => "running",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Cancelled => "cancelled",
            CampaignStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "scheduled" => Ok(CampaignStatus::Scheduled),
            "running" => Ok(CampaignStatus::Running),
            "paused" => Ok(CampaignStatus::Paused),
            "completed" => Ok(CampaignStatus::Completed),
            "cancelled" => Ok(CampaignStatus::Cancelled),
            "failed" => Ok(CampaignStatus::Failed),
            _ => Err(format!("Invalid campaign status: {}", s)),
        }
    }
}

/// Fixed targeting groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixedGroup {
    Leads,
    #[serde(alias = "existing-contacts", alias = "existing_contacts")]
    Supporters,
    #[serde(alias = "internal-team", alias = "internal_team")]
    Team,
}

/// Who a campaign is sent to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetingRule {
    pub tag_ids: Vec<TagId>,
    pub groups: Vec<FixedGroup>,
    pub segment_id: Option<SegmentId>,
}

impl TargetingRule {
    pub fn is_empty(&self) -> bool {
        self.tag_ids.is_empty() && self.groups.is_empty() && self.segment_id.is_none()
    }
}

/// Campaign model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub name: String,
    pub message: String,
    pub media_url: Option<String>,
    pub media_type: Option<String>,
    pub target: serde_json::Value,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub status: String,
    pub total_recipients: i32,
    pub sent_count: i32,
    pub delivered_count: i32,
    pub read_count: i32,
    pub failed_count: i32,
    pub created_by: Option<uuid::Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// Get status enum
    pub fn status_enum(&self) -> Option<CampaignStatus> {
        self.status.parse().ok()
    }

    /// Get the targeting rule; a malformed rule reads as empty
    pub fn targeting_rule(&self) -> TargetingRule {
        serde_json::from_value(self.target.clone()).unwrap_or_default()
    }

    /// Attached media, if both the URL and a known type are present
    pub fn media(&self) -> Option<(&str, MediaType)> {
        let url = self.media_url.as_deref().filter(|u| !u.is_empty())?;
        let kind = self.media_type.as_deref()?.parse().ok()?;
        Some((url, kind))
    }

    pub fn counters(&self) -> CampaignCounters {
        CampaignCounters {
            total_recipients: self.total_recipients,
            sent: self.sent_count,
            delivered: self.delivered_count,
            read: self.read_count,
            failed: self.failed_count,
        }
    }
}

/// Denormalized campaign counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignCounters {
    pub total_recipients: i32,
    pub sent: i32,
    pub delivered: i32,
    pub read: i32,
    pub failed: i32,
}

/// Per-recipient item status. Also used for generic message records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Queued,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Queued => "queued",
            ItemStatus::Sent => "sent",
            ItemStatus::Delivered => "delivered",
            ItemStatus::Read => "read",
            ItemStatus::Failed => "failed",
        }
    }

    /// Whether an item in this status is included in the campaign's sent counter
    pub fn counts_as_sent(&self) -> bool {
        matches!(
            self,
            ItemStatus::Sent | ItemStatus::Delivered | ItemStatus::Read
        )
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "queued" => Ok(ItemStatus::Queued),
            "sent" => Ok(ItemStatus::Sent),
            "delivered" => Ok(ItemStatus::Delivered),
            "read" => Ok(ItemStatus::Read),
            "failed" => Ok(ItemStatus::Failed),
            _ => Err(format!("Invalid item status: {}", s)),
        }
    }
}

/// Campaign item model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CampaignItem {
    pub id: CampaignItemId,
    pub tenant_id: TenantId,
    pub campaign_id: CampaignId,
    pub contact_id: Option<ContactId>,
    pub recipient_name: String,
    pub recipient_phone: String,
    pub substitutions: serde_json::Value,
    pub status: String,
    pub message_id: Option<String>,
    pub error_message: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CampaignItem {
    /// Get status enum
    pub fn status_enum(&self) -> Option<ItemStatus> {
        self.status.parse().ok()
    }
}

/// Items of a campaign that have not reached a dispatch outcome yet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnfinishedCounts {
    pub pending: i64,
    pub queued: i64,
}

impl UnfinishedCounts {
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.queued == 0
    }
}

/// Delivery status reported by the gateway for one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum DeliveryStatus {
    ServerAck,
    Delivered,
    Read,
    Failed { error: String },
}

/// The stored effect of applying a [`DeliveryStatus`] to an item.
///
/// Counter deltas are relative and are applied in the same transaction as
/// the item update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionPlan {
    pub to: ItemStatus,
    /// Entering QUEUED outside a claim; stamps the claim time so stale recovery can see it
    pub stamp_claimed: bool,
    pub stamp_sent: bool,
    pub stamp_delivered: bool,
    pub stamp_read: bool,
    pub error: Option<String>,
    pub sent_delta: i32,
    pub delivered_delta: i32,
    pub read_delta: i32,
    pub failed_delta: i32,
}

impl TransitionPlan {
    fn to(status: ItemStatus) -> Self {
        Self {
            to: status,
            stamp_claimed: false,
            stamp_sent: false,
            stamp_delivered: false,
            stamp_read: false,
            error: None,
            sent_delta: 0,
            delivered_delta: 0,
            read_delta: 0,
            failed_delta: 0,
        }
    }
}

/// Decide how a delivery status changes an item currently in `current`.
///
/// Returns `None` when the update has no effect. Counters only move on a
/// real transition, so the same status applied twice counts once.
pub fn plan_delivery_transition(
    current: ItemStatus,
    delivered_at_set: bool,
    read_at_set: bool,
    update: &DeliveryStatus,
) -> Option<TransitionPlan> {
    let sent_in = |to_counted: bool| match (current.counts_as_sent(), to_counted) {
        (false, true) => 1,
        (true, false) => -1,
        _ => 0,
    };
    let failed_out = if current == ItemStatus::Failed { -1 } else { 0 };

    match update {
        DeliveryStatus::ServerAck => (current == ItemStatus::Pending).then(|| TransitionPlan {
            stamp_claimed: true,
            stamp_sent: true,
            ..TransitionPlan::to(ItemStatus::Queued)
        }),
        DeliveryStatus::Delivered => {
            matches!(current, ItemStatus::Sent | ItemStatus::Queued).then(|| TransitionPlan {
                stamp_delivered: !delivered_at_set,
                sent_delta: sent_in(true),
                delivered_delta: i32::from(!delivered_at_set),
                ..TransitionPlan::to(ItemStatus::Delivered)
            })
        }
        DeliveryStatus::Read => (current != ItemStatus::Read).then(|| TransitionPlan {
            stamp_read: !read_at_set,
            sent_delta: sent_in(true),
            read_delta: i32::from(!read_at_set),
            failed_delta: failed_out,
            ..TransitionPlan::to(ItemStatus::Read)
        }),
        DeliveryStatus::Failed { error } => (current != ItemStatus::Failed).then(|| TransitionPlan {
            error: Some(error.clone()),
            sent_delta: sent_in(false),
            failed_delta: 1,
            ..TransitionPlan::to(ItemStatus::Failed)
        }),
    }
}

/// Raw inbound webhook log entry
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WebhookLog {
    pub id: WebhookLogId,
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub attempts: i32,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Generic (non-campaign) message
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub tenant_id: TenantId,
    pub session_id: Option<SessionId>,
    pub phone: String,
    pub content: String,
    pub status: String,
    pub external_id: Option<String>,
    pub gateway_message_id: Option<String>,
    pub error_message: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Get status enum
    pub fn status_enum(&self) -> Option<ItemStatus> {
        self.status.parse().ok()
    }
}

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// Durable queue job
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub run_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
