//! Common types for Parley

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for tenants
pub type TenantId = Uuid;

/// Unique identifier for campaigns
pub type CampaignId = Uuid;

/// Unique identifier for campaign items
pub type CampaignItemId = Uuid;

/// Unique identifier for contacts in the tenant directory
pub type ContactId = Uuid;

/// Unique identifier for contact tags
pub type TagId = Uuid;

/// Unique identifier for saved segments
pub type SegmentId = Uuid;

/// Unique identifier for gateway sessions
pub type SessionId = Uuid;

/// Unique identifier for webhook log entries
pub type WebhookLogId = Uuid;

/// Unique identifier for generic (non-campaign) messages
pub type MessageId = Uuid;

/// Unique identifier for queued jobs
pub type JobId = Uuid;

/// Explicit handle to one tenant's storage partition.
///
/// Every tenant-owned read or write takes one of these; nothing in the
/// system resolves the current tenant from ambient state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantScope {
    pub tenant_id: TenantId,
}

impl TenantScope {
    pub fn new(tenant_id: TenantId) -> Self {
        Self { tenant_id }
    }
}

impl std::fmt::Display for TenantScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tenant_id)
    }
}

/// Kind of media attached to a campaign
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Image,
    Video,
    Audio,
    Document,
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaType::Image => write!(f, "image"),
            MediaType::Video => write!(f, "video"),
            MediaType::Audio => write!(f, "audio"),
            MediaType::Document => write!(f, "document"),
        }
    }
}

impl std::str::FromStr for MediaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(MediaType::Image),
            "video" => Ok(MediaType::Video),
            "audio" => Ok(MediaType::Audio),
            "document" => Ok(MediaType::Document),
            _ => Err(format!("Invalid media type: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_type_roundtrip() {
        for kind in [MediaType::Image, MediaType::Document] {
            assert_eq!(kind.to_string().parse::<MediaType>(), Ok(kind));
        }
        assert!("sticker".parse::<MediaType>().is_err());
    }
}
