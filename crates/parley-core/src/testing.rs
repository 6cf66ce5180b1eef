//! Shared fixtures for unit tests

use crate::gateway::{ConnectionState, GatewayClient, GatewayError, InstanceDescriptor, SendReceipt};
use async_trait::async_trait;
use parley_common::config::DispatchConfig;
use parley_common::types::{CampaignId, MediaType, TagId, TenantScope};
use parley_storage::models::{Campaign, CampaignStatus, GatewaySession, TargetingRule};
use parley_storage::repository::{
    CampaignRepository, CreateCampaign, CreateSession, CreateTenant, NewCampaignItem,
    Repositories, SessionRepository, TenantRepository,
};
use parley_storage::MemoryStore;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::Arc;

pub(crate) const SECRET: &str = "whsec_test";

/// One call received by the scripted gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SentRecord {
    pub instance: String,
    pub phone: String,
    pub text: String,
    pub media_url: Option<String>,
}

/// In-process gateway returning `gw-<n>` message ids
#[derive(Default)]
pub(crate) struct ScriptedGateway {
    sent: Mutex<Vec<SentRecord>>,
    failing_phones: Mutex<HashSet<String>>,
    pause_after: Mutex<Option<(usize, MemoryStore, TenantScope, CampaignId)>>,
    state: Mutex<Option<ConnectionState>>,
    instances: Mutex<Vec<(String, String)>>,
}

impl ScriptedGateway {
    pub fn sent(&self) -> Vec<SentRecord> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fail_phone(&self, phone: &str) {
        self.failing_phones.lock().unwrap().insert(phone.to_string());
    }

    /// Pause the campaign right after the `n`th successful send
    pub fn pause_after(&self, n: usize, store: &MemoryStore, scope: TenantScope, id: CampaignId) {
        *self.pause_after.lock().unwrap() = Some((n, store.clone(), scope, id));
    }

    /// `None` makes connection checks fail
    pub fn set_state(&self, state: Option<ConnectionState>) {
        *self.state.lock().unwrap() = state;
    }

    pub fn instances(&self) -> Vec<(String, String)> {
        self.instances.lock().unwrap().clone()
    }

    async fn record(
        &self,
        instance: &str,
        phone: &str,
        text: &str,
        media_url: Option<&str>,
    ) -> Result<SendReceipt, GatewayError> {
        if self.failing_phones.lock().unwrap().contains(phone) {
            return Err(GatewayError::Http {
                status: 400,
                body: "number not on network".into(),
            });
        }

        let count = {
            let mut sent = self.sent.lock().unwrap();
            sent.push(SentRecord {
                instance: instance.to_string(),
                phone: phone.to_string(),
                text: text.to_string(),
                media_url: media_url.map(str::to_string),
            });
            sent.len()
        };

        let pause = self.pause_after.lock().unwrap().clone();
        if let Some((n, store, scope, id)) = pause {
            if n == count {
                store
                    .transition(scope, id, &[CampaignStatus::Running], CampaignStatus::Paused)
                    .await
                    .unwrap();
            }
        }

        Ok(SendReceipt {
            message_id: Some(format!("gw-{}", count)),
        })
    }
}

#[async_trait]
impl GatewayClient for ScriptedGateway {
    async fn create_instance(
        &self,
        instance: &str,
        webhook_url: &str,
    ) -> Result<InstanceDescriptor, GatewayError> {
        self.instances
            .lock()
            .unwrap()
            .push((instance.to_string(), webhook_url.to_string()));
        Ok(InstanceDescriptor {
            instance_name: instance.to_string(),
            token: Some(format!("tok-{}", instance)),
        })
    }

    async fn send_text(
        &self,
        instance: &str,
        phone: &str,
        text: &str,
    ) -> Result<SendReceipt, GatewayError> {
        self.record(instance, phone, text, None).await
    }

    async fn send_media(
        &self,
        instance: &str,
        phone: &str,
        media_url: &str,
        _media_type: MediaType,
        caption: &str,
    ) -> Result<SendReceipt, GatewayError> {
        self.record(instance, phone, caption, Some(media_url)).await
    }

    async fn connection_state(&self, _instance: &str) -> Result<ConnectionState, GatewayError> {
        self.state
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| GatewayError::Decode("gateway unreachable".into()))
    }
}

/// A tenant with one connected session on the memory backend
pub(crate) struct Fixture {
    pub store: MemoryStore,
    pub repos: Repositories,
    pub scope: TenantScope,
    pub session: GatewaySession,
    pub gateway: Arc<ScriptedGateway>,
}

impl Fixture {
    pub async fn new() -> Self {
        let store = MemoryStore::new();
        let tenant = TenantRepository::create(
            &store,
            CreateTenant {
                name: "Acme".into(),
                slug: "acme".into(),
            },
        )
        .await
        .unwrap();
        let scope = TenantScope::new(tenant.id);
        let session = Self::add_session(&store, scope, "acme-main").await;

        Self {
            repos: store.repositories(),
            store,
            scope,
            session,
            gateway: Arc::new(ScriptedGateway::default()),
        }
    }

    pub async fn add_session(
        store: &MemoryStore,
        scope: TenantScope,
        instance_id: &str,
    ) -> GatewaySession {
        SessionRepository::create(
            store,
            scope,
            CreateSession {
                name: "Main".into(),
                instance_id: instance_id.into(),
                access_token: None,
                webhook_secret: SECRET.into(),
                daily_message_limit: 1000,
            },
        )
        .await
        .unwrap()
    }

    pub fn dispatch_config() -> DispatchConfig {
        DispatchConfig {
            pacing_enabled: false,
            ..Default::default()
        }
    }

    /// Insert consenting contacts that share a fresh tag
    pub fn tagged_contacts(&self, contacts: &[(&str, &str)]) -> TagId {
        let tag = self.store.insert_tag(self.scope, "audience", None);
        for (name, phone) in contacts {
            let contact = self.store.insert_contact(self.scope, name, phone);
            self.store.tag_contact(contact.id, tag.id);
        }
        tag.id
    }

    pub async fn draft_campaign(&self, message: &str, target: TargetingRule) -> Campaign {
        CampaignRepository::create(
            &self.store,
            self.scope,
            CreateCampaign {
                session_id: self.session.id,
                name: "Launch".into(),
                message: message.into(),
                media_url: None,
                media_type: None,
                target,
                created_by: None,
            },
        )
        .await
        .unwrap()
    }

    /// A RUNNING campaign with `n` items whose phones are `55119000000<i>`
    pub async fn running_campaign(&self, message: &str, n: usize) -> Campaign {
        let campaign = self.draft_campaign(message, TargetingRule::default()).await;
        let items = (0..n)
            .map(|i| NewCampaignItem {
                contact_id: None,
                recipient_name: format!("Recipient {}", i),
                recipient_phone: format!("55119000000{:02}", i),
                substitutions: serde_json::json!({ "name": format!("Recipient {}", i) }),
            })
            .collect();
        self.store
            .populate_and_start(self.scope, campaign.id, items)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn campaign(&self, id: CampaignId) -> Campaign {
        CampaignRepository::get(&self.store, self.scope, id)
            .await
            .unwrap()
            .unwrap()
    }
}
