//! Gateway session provisioning and health checks

use crate::gateway::{ConnectionState, GatewayClient};
use parley_common::types::TenantScope;
use parley_common::{Error, Result};
use parley_storage::models::{ConnectionChange, GatewaySession, PhoneUpdate, SessionStatus};
use parley_storage::repository::{CreateSession, Repositories};
use rand::RngCore;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_DAILY_LIMIT: i32 = 1000;

/// Outcome of one health-check pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub checked: usize,
    pub healthy: usize,
}

/// Creates gateway sessions and keeps their health current
pub struct SessionManager {
    repos: Repositories,
    gateway: Arc<dyn GatewayClient>,
    public_base_url: String,
}

impl SessionManager {
    pub fn new(repos: Repositories, gateway: Arc<dyn GatewayClient>, public_base_url: &str) -> Self {
        Self {
            repos,
            gateway,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Provision a new session: register the instance with the gateway,
    /// then store the session together with its index entry.
    pub async fn provision(
        &self,
        scope: TenantScope,
        name: &str,
        daily_limit: Option<i32>,
    ) -> Result<GatewaySession> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("session name is required".into()));
        }
        let daily_message_limit = daily_limit.unwrap_or(DEFAULT_DAILY_LIMIT);
        if daily_message_limit <= 0 {
            return Err(Error::Validation("daily limit must be positive".into()));
        }

        let instance_id = instance_id_for(name);
        let webhook_url = format!("{}/webhook/{}", self.public_base_url, instance_id);
        let descriptor = self
            .gateway
            .create_instance(&instance_id, &webhook_url)
            .await?;

        let session = self
            .repos
            .sessions
            .create(
                scope,
                CreateSession {
                    name: name.to_string(),
                    instance_id: descriptor.instance_name,
                    access_token: descriptor.token,
                    webhook_secret: random_hex(32),
                    daily_message_limit,
                },
            )
            .await?;

        info!(
            tenant_id = %scope,
            session_id = %session.id,
            instance = %session.instance_id,
            "Gateway session provisioned"
        );
        Ok(session)
    }

    /// Ask the gateway for the state of every active session and record it
    pub async fn check_health(&self, scope: TenantScope) -> Result<HealthReport> {
        let mut report = HealthReport::default();

        for session in self.repos.sessions.list_active(scope).await? {
            report.checked += 1;
            let change = match self.gateway.connection_state(&session.instance_id).await {
                Ok(state) => change_for(&state),
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "Session health check failed");
                    None
                }
            };

            match change {
                Some(change) => {
                    if change.is_healthy == Some(true) {
                        report.healthy += 1;
                    } else if session.is_connected() {
                        warn!(session_id = %session.id, status = %change.status, "Session lost its connection");
                    }
                    self.repos
                        .sessions
                        .apply_connection(scope, session.id, &change)
                        .await?;
                }
                None => {
                    self.repos
                        .sessions
                        .record_health(scope, session.id, false)
                        .await?
                }
            }
        }

        Ok(report)
    }
}

fn change_for(state: &ConnectionState) -> Option<ConnectionChange> {
    let (status, healthy) = match state {
        ConnectionState::Open => (SessionStatus::Connected, true),
        ConnectionState::Connecting => (SessionStatus::Connecting, false),
        ConnectionState::Close => (SessionStatus::Disconnected, false),
        ConnectionState::Other(_) => return None,
    };
    Some(ConnectionChange {
        status,
        is_healthy: Some(healthy),
        phone: PhoneUpdate::Keep,
    })
}

/// Readable, globally unique instance id: `<slug>-<random hex>`
fn instance_id_for(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    let slug = if slug.is_empty() { "session" } else { slug };
    format!("{}-{}", slug, random_hex(4))
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use parley_storage::repository::SessionRepository;
    use pretty_assertions::assert_eq;

    fn manager(fx: &Fixture) -> SessionManager {
        SessionManager::new(fx.repos.clone(), fx.gateway.clone(), "https://parley.example.com/")
    }

    #[test]
    fn test_instance_id_shape() {
        let id = instance_id_for("  Campanha Recife #2 ");
        assert!(id.starts_with("campanha-recife-2-"), "{id}");
        assert_eq!(id.len(), "campanha-recife-2-".len() + 8);
        assert!(instance_id_for("!!!").starts_with("session-"));
    }

    #[tokio::test]
    async fn test_provision_registers_and_indexes() {
        let fx = Fixture::new().await;
        let session = manager(&fx)
            .provision(fx.scope, "Sales Line", None)
            .await
            .unwrap();

        assert_eq!(session.daily_message_limit, DEFAULT_DAILY_LIMIT);
        assert_eq!(session.status, "disconnected");
        assert_eq!(session.webhook_secret.len(), 64);
        assert_eq!(
            session.access_token.as_deref(),
            Some(format!("tok-{}", session.instance_id).as_str())
        );

        let instances = fx.gateway.instances();
        assert_eq!(
            instances,
            vec![(
                session.instance_id.clone(),
                format!("https://parley.example.com/webhook/{}", session.instance_id)
            )]
        );
        assert_eq!(
            SessionRepository::lookup_tenant(&fx.store, &session.instance_id)
                .await
                .unwrap(),
            Some(fx.scope.tenant_id)
        );
    }

    #[tokio::test]
    async fn test_provision_validates_input() {
        let fx = Fixture::new().await;
        let manager = manager(&fx);
        assert!(matches!(
            manager.provision(fx.scope, " ", None).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            manager.provision(fx.scope, "Line", Some(0)).await,
            Err(Error::Validation(_))
        ));
        assert!(fx.gateway.instances().is_empty());
    }

    #[tokio::test]
    async fn test_health_check_records_state() {
        let fx = Fixture::new().await;
        let manager = manager(&fx);

        fx.gateway.set_state(Some(ConnectionState::Open));
        let report = manager.check_health(fx.scope).await.unwrap();
        assert_eq!(report, HealthReport { checked: 1, healthy: 1 });
        let session = SessionRepository::get(&fx.store, fx.scope, fx.session.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, "connected");
        assert!(session.last_health_check.is_some());

        fx.gateway.set_state(None);
        let report = manager.check_health(fx.scope).await.unwrap();
        assert_eq!(report.healthy, 0);
        let session = SessionRepository::get(&fx.store, fx.scope, fx.session.id)
            .await
            .unwrap()
            .unwrap();
        assert!(!session.is_healthy);
        assert_eq!(session.status, "connected");
    }
}
