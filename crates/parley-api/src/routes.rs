//! API routes

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::handlers::{campaigns, health, sessions, webhook};
use crate::state::AppState;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);

    let health_routes = Router::new()
        .route("/", get(health::health))
        .route("/ready", get(health::readiness));

    // Campaign control, scoped by tenant
    let campaign_routes = Router::new()
        .route("/:campaign_id", get(campaigns::get_campaign))
        .route("/:campaign_id/start", post(campaigns::start_campaign))
        .route("/:campaign_id/pause", post(campaigns::pause_campaign))
        .route("/:campaign_id/resume", post(campaigns::resume_campaign))
        .route("/:campaign_id/cancel", post(campaigns::cancel_campaign))
        .route("/:campaign_id/schedule", post(campaigns::schedule_campaign))
        .route(
            "/:campaign_id/recalculate",
            post(campaigns::recalculate_campaign),
        );

    let api_routes = Router::new()
        .nest("/tenants/:tenant_id/campaigns", campaign_routes)
        .route("/tenants/:tenant_id/sessions", post(sessions::create_session));

    Router::new()
        .nest("/health", health_routes)
        .route("/webhook/:instance_name", post(webhook::receive_webhook))
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Bytes;
    use axum::http::{HeaderName, HeaderValue, StatusCode};
    use axum_test::TestServer;
    use chrono::{Duration, Utc};
    use parley_common::config::WebhookConfig;
    use parley_common::signature::{self, SIGNATURE_HEADER, TIMESTAMP_HEADER};
    use parley_common::types::{MediaType, TenantScope};
    use parley_core::gateway::{
        ConnectionState, GatewayClient, GatewayError, InstanceDescriptor, SendReceipt,
    };
    use parley_core::queue::RECONCILE_QUEUE;
    use parley_core::{CampaignManager, SessionManager, TaskQueue, WebhookIngestor};
    use parley_storage::models::{GatewaySession, TargetingRule};
    use parley_storage::repository::{
        CampaignRepository, CreateCampaign, CreateSession, CreateTenant, SessionRepository,
        TenantRepository,
    };
    use parley_storage::MemoryStore;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use uuid::Uuid;

    const SECRET: &str = "whsec_api";

    /// Gateway that accepts everything and never sends
    struct StubGateway;

    #[async_trait]
    impl GatewayClient for StubGateway {
        async fn create_instance(
            &self,
            instance: &str,
            _webhook_url: &str,
        ) -> Result<InstanceDescriptor, GatewayError> {
            Ok(InstanceDescriptor {
                instance_name: instance.to_string(),
                token: None,
            })
        }

        async fn send_text(
            &self,
            _instance: &str,
            _phone: &str,
            _text: &str,
        ) -> Result<SendReceipt, GatewayError> {
            Ok(SendReceipt { message_id: None })
        }

        async fn send_media(
            &self,
            _instance: &str,
            _phone: &str,
            _media_url: &str,
            _media_type: MediaType,
            _caption: &str,
        ) -> Result<SendReceipt, GatewayError> {
            Ok(SendReceipt { message_id: None })
        }

        async fn connection_state(&self, _instance: &str) -> Result<ConnectionState, GatewayError> {
            Ok(ConnectionState::Open)
        }
    }

    struct TestApp {
        server: TestServer,
        store: MemoryStore,
        scope: TenantScope,
        session: GatewaySession,
    }

    async fn app() -> TestApp {
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
        let session = SessionRepository::create(
            &store,
            scope,
            CreateSession {
                name: "Main".into(),
                instance_id: "acme-main".into(),
                access_token: None,
                webhook_secret: SECRET.into(),
                daily_message_limit: 1000,
            },
        )
        .await
        .unwrap();

        let repos = store.repositories();
        let queue = TaskQueue::new(repos.jobs.clone(), 5);
        let state = AppState {
            campaigns: Arc::new(CampaignManager::new(repos.clone(), queue.clone())),
            ingestor: Arc::new(WebhookIngestor::new(
                repos.clone(),
                queue,
                WebhookConfig::default(),
            )),
            sessions: Arc::new(SessionManager::new(
                repos.clone(),
                Arc::new(StubGateway),
                "https://parley.example.com",
            )),
            repos,
        };

        TestApp {
            server: TestServer::new(create_router(state)).unwrap(),
            store,
            scope,
            session,
        }
    }

    impl TestApp {
        async fn draft_campaign(&self, target: TargetingRule) -> Uuid {
            CampaignRepository::create(
                &self.store,
                self.scope,
                CreateCampaign {
                    session_id: self.session.id,
                    name: "Launch".into(),
                    message: "Hello {{first_name}}".into(),
                    media_url: None,
                    media_type: None,
                    target,
                    created_by: None,
                },
            )
            .await
            .unwrap()
            .id
        }

        fn campaign_path(&self, id: Uuid, action: &str) -> String {
            format!("/api/v1/tenants/{}/campaigns/{}{}", self.scope.tenant_id, id, action)
        }
    }

    fn header(name: &'static str, value: &str) -> (HeaderName, HeaderValue) {
        (
            HeaderName::from_static(name),
            HeaderValue::from_str(value).unwrap(),
        )
    }

    fn status_event() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "event": "messages.update",
            "instance": "acme-main",
            "data": { "keyId": "gw-1", "status": "DELIVERY_ACK" }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let app = app().await;

        let response = app.server.get("/health").await;
        response.assert_status_ok();
        assert_eq!(response.json::<Value>(), json!({ "status": "healthy" }));

        app.server.get("/health/ready").await.assert_status_ok();
    }

    #[tokio::test]
    async fn test_signed_webhook_is_accepted() {
        let app = app().await;
        let body = status_event();
        let ts = Utc::now().timestamp();
        let sig = signature::sign(SECRET, ts, &body).unwrap();
        let (sig_name, sig_value) = header(SIGNATURE_HEADER, &sig);
        let (ts_name, ts_value) = header(TIMESTAMP_HEADER, &ts.to_string());

        let response = app
            .server
            .post("/webhook/acme-main")
            .add_header(sig_name, sig_value)
            .add_header(ts_name, ts_value)
            .bytes(Bytes::from(body))
            .await;

        response.assert_status(StatusCode::ACCEPTED);
        assert_eq!(response.json::<Value>(), json!({ "status": "received" }));
        assert_eq!(app.store.webhook_log_count(), 1);
        let jobs = app.store.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].queue, RECONCILE_QUEUE);
    }

    #[tokio::test]
    async fn test_webhook_rejections_store_nothing() {
        let app = app().await;
        let body = status_event();
        let ts = Utc::now().timestamp();

        // Unknown instance
        app.server
            .post("/webhook/nobody")
            .bytes(Bytes::from(body.clone()))
            .await
            .assert_status(StatusCode::NOT_FOUND);

        // Missing signature
        app.server
            .post("/webhook/acme-main")
            .bytes(Bytes::from(body.clone()))
            .await
            .assert_status(StatusCode::UNAUTHORIZED);

        // Signed with the wrong secret
        let sig = signature::sign("whsec_other", ts, &body).unwrap();
        let (sig_name, sig_value) = header(SIGNATURE_HEADER, &sig);
        let (ts_name, ts_value) = header(TIMESTAMP_HEADER, &ts.to_string());
        app.server
            .post("/webhook/acme-main")
            .add_header(sig_name, sig_value)
            .add_header(ts_name, ts_value)
            .bytes(Bytes::from(body))
            .await
            .assert_status(StatusCode::UNAUTHORIZED);

        // Not JSON
        app.server
            .post("/webhook/acme-main")
            .bytes(Bytes::from_static(b"not json"))
            .await
            .assert_status(StatusCode::BAD_REQUEST);

        assert_eq!(app.store.webhook_log_count(), 0);
        assert!(app.store.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_campaign_lifecycle_over_http() {
        let app = app().await;
        let tag = app.store.insert_tag(app.scope, "audience", None);
        let contact = app.store.insert_contact(app.scope, "Ana Souza", "81999990000");
        app.store.tag_contact(contact.id, tag.id);
        let id = app
            .draft_campaign(TargetingRule {
                tag_ids: vec![tag.id],
                ..Default::default()
            })
            .await;

        let response = app.server.get(&app.campaign_path(id, "")).await;
        response.assert_status_ok();
        assert_eq!(response.json::<Value>()["status"], "draft");

        // Draft campaigns cannot be paused
        let response = app.server.post(&app.campaign_path(id, "/pause")).await;
        response.assert_status(StatusCode::CONFLICT);
        assert_eq!(response.json::<Value>()["error"], "invalid_state");

        let response = app.server.post(&app.campaign_path(id, "/start")).await;
        response.assert_status_ok();
        let body = response.json::<Value>();
        assert_eq!(body["status"], "running");
        assert_eq!(body["total_recipients"], 1);

        let response = app.server.post(&app.campaign_path(id, "/pause")).await;
        response.assert_status_ok();
        assert_eq!(response.json::<Value>()["status"], "paused");

        let response = app.server.post(&app.campaign_path(id, "/resume")).await;
        response.assert_status_ok();
        assert_eq!(response.json::<Value>()["status"], "running");

        let response = app.server.post(&app.campaign_path(id, "/cancel")).await;
        response.assert_status_ok();
        assert_eq!(response.json::<Value>()["status"], "cancelled");
    }

    #[tokio::test]
    async fn test_campaign_errors_map_to_statuses() {
        let app = app().await;
        let id = app.draft_campaign(TargetingRule::default()).await;

        let response = app.server.post(&app.campaign_path(id, "/start")).await;
        response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(response.json::<Value>()["error"], "no_target_selected");

        app.server
            .get(&app.campaign_path(Uuid::new_v4(), ""))
            .await
            .assert_status_not_found();

        // Another tenant's id does not reach this campaign
        app.server
            .get(&format!(
                "/api/v1/tenants/{}/campaigns/{}",
                Uuid::new_v4(),
                id
            ))
            .await
            .assert_status_not_found();

        let response = app
            .server
            .post(&app.campaign_path(id, "/schedule"))
            .json(&json!({ "scheduled_at": Utc::now() - Duration::minutes(1) }))
            .await;
        response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(response.json::<Value>()["error"], "invalid_schedule");

        let response = app
            .server
            .post(&app.campaign_path(id, "/schedule"))
            .json(&json!({ "scheduled_at": Utc::now() + Duration::hours(1) }))
            .await;
        response.assert_status_ok();
        assert_eq!(response.json::<Value>()["status"], "scheduled");
    }

    #[tokio::test]
    async fn test_recalculate_dry_run() {
        let app = app().await;
        let id = app.draft_campaign(TargetingRule::default()).await;

        let response = app
            .server
            .post(&app.campaign_path(id, "/recalculate"))
            .add_query_param("dry_run", true)
            .await;
        response.assert_status_ok();
        let body = response.json::<Value>();
        assert_eq!(body["drifted"], false);
        assert_eq!(body["applied"], false);
    }

    #[tokio::test]
    async fn test_provision_session() {
        let app = app().await;
        let path = format!("/api/v1/tenants/{}/sessions", app.scope.tenant_id);

        let response = app
            .server
            .post(&path)
            .json(&json!({ "name": "Sales Line", "daily_limit": 250 }))
            .await;
        response.assert_status(StatusCode::CREATED);
        let body = response.json::<Value>();
        assert_eq!(body["daily_message_limit"], 250);
        assert_eq!(body["webhook_secret"].as_str().unwrap().len(), 64);
        assert!(body["instance_id"]
            .as_str()
            .unwrap()
            .starts_with("sales-line-"));

        app.server
            .post(&path)
            .json(&json!({ "name": "" }))
            .await
            .assert_status(StatusCode::UNPROCESSABLE_ENTITY);

        app.server
            .post(&format!("/api/v1/tenants/{}/sessions", Uuid::new_v4()))
            .json(&json!({ "name": "Other" }))
            .await
            .assert_status_not_found();
    }
}
