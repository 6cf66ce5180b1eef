//! HTTP gateway client

use super::{ConnectionState, GatewayClient, GatewayError, InstanceDescriptor, SendReceipt};
use async_trait::async_trait;
use parley_common::config::GatewayConfig;
use parley_common::phone;
use parley_common::types::MediaType;
use reqwest::{Client, Method, RequestBuilder};
use serde_json::{json, Value};
use tracing::{debug, error};

/// Events the gateway is asked to deliver to the webhook endpoint
const WEBHOOK_EVENTS: &[&str] = &[
    "QRCODE_UPDATED",
    "CONNECTION_UPDATE",
    "MESSAGES_UPDATE",
    "SEND_MESSAGE",
];

/// Gateway client over the Evolution-style HTTP API
pub struct HttpGatewayClient {
    config: GatewayConfig,
    client: Client,
}

impl HttpGatewayClient {
    /// Create a new gateway client
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self { config, client })
    }

    /// Build a request carrying the API key header
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        self.client
            .request(method, url)
            .header("apikey", &self.config.api_key)
    }

    fn number(&self, raw: &str) -> Result<String, GatewayError> {
        phone::normalize(
            raw,
            &self.config.default_country_code,
            self.config.national_number_max_len,
        )
        .ok_or_else(|| GatewayError::InvalidPhone(raw.to_string()))
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Value, GatewayError> {
        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), body = %body, "Gateway request rejected");
            return Err(GatewayError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| GatewayError::Decode(e.to_string()))
    }
}

/// Pull the gateway message id out of a send response
fn extract_message_id(response: &Value) -> Option<String> {
    response
        .pointer("/key/id")
        .or_else(|| response.get("messageId"))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl GatewayClient for HttpGatewayClient {
    async fn create_instance(
        &self,
        instance: &str,
        webhook_url: &str,
    ) -> Result<InstanceDescriptor, GatewayError> {
        let body = json!({
            "instanceName": instance,
            "qrcode": true,
            "integration": "WHATSAPP-BAILEYS",
            "webhook": webhook_url,
            "webhookByEvents": false,
            "events": WEBHOOK_EVENTS,
        });

        let response = self
            .execute(self.request(Method::POST, "/instance/create").json(&body))
            .await?;

        let instance_name = response
            .pointer("/instance/instanceName")
            .and_then(Value::as_str)
            .unwrap_or(instance)
            .to_string();
        let token = match response.get("hash") {
            Some(Value::String(token)) => Some(token.clone()),
            Some(hash) => hash.get("apikey").and_then(Value::as_str).map(str::to_string),
            None => None,
        };

        debug!(instance = %instance_name, "Gateway instance created");
        Ok(InstanceDescriptor {
            instance_name,
            token,
        })
    }

    async fn send_text(
        &self,
        instance: &str,
        phone: &str,
        text: &str,
    ) -> Result<SendReceipt, GatewayError> {
        let body = json!({
            "number": self.number(phone)?,
            "text": text,
        });

        let response = self
            .execute(
                self.request(Method::POST, &format!("/message/sendText/{}", instance))
                    .json(&body),
            )
            .await?;

        Ok(SendReceipt {
            message_id: extract_message_id(&response),
        })
    }

    async fn send_media(
        &self,
        instance: &str,
        phone: &str,
        media_url: &str,
        media_type: MediaType,
        caption: &str,
    ) -> Result<SendReceipt, GatewayError> {
        let mut media = json!({
            "mediatype": media_type.to_string(),
            "media": media_url,
        });
        if !caption.is_empty() {
            media["caption"] = Value::String(caption.to_string());
        }
        let body = json!({
            "number": self.number(phone)?,
            "mediaMessage": media,
        });

        let response = self
            .execute(
                self.request(Method::POST, &format!("/message/sendMedia/{}", instance))
                    .json(&body),
            )
            .await?;

        Ok(SendReceipt {
            message_id: extract_message_id(&response),
        })
    }

    async fn connection_state(&self, instance: &str) -> Result<ConnectionState, GatewayError> {
        let response = self
            .execute(self.request(
                Method::GET,
                &format!("/instance/connectionState/{}", instance),
            ))
            .await?;

        response
            .pointer("/instance/state")
            .or_else(|| response.get("state"))
            .and_then(Value::as_str)
            .map(ConnectionState::parse)
            .ok_or_else(|| GatewayError::Decode(format!("no connection state in {}", response)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpGatewayClient {
        HttpGatewayClient::new(GatewayConfig {
            base_url: server.uri(),
            api_key: "test-key".into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_text_normalizes_phone_and_reads_key_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/message/sendText/acme-main"))
            .and(header("apikey", "test-key"))
            .and(body_json(json!({"number": "5511999990000", "text": "Hi Ana"})))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!({"key": {"id": "3EB0ABC"}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let receipt = client(&server)
            .send_text("acme-main", "(11) 99999-0000", "Hi Ana")
            .await
            .unwrap();
        assert_eq!(receipt.message_id.as_deref(), Some("3EB0ABC"));
    }

    #[tokio::test]
    async fn test_send_without_message_id_still_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/message/sendText/acme-main"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "PENDING"})))
            .mount(&server)
            .await;

        let receipt = client(&server)
            .send_text("acme-main", "5511999990000", "Hi")
            .await
            .unwrap();
        assert_eq!(receipt.message_id, None);
    }

    #[tokio::test]
    async fn test_send_media_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/message/sendMedia/acme-main"))
            .and(body_json(json!({
                "number": "5511999990000",
                "mediaMessage": {
                    "mediatype": "image",
                    "media": "https://cdn.example.com/flyer.png",
                    "caption": "See you there"
                }
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"key": {"id": "M1"}})))
            .expect(1)
            .mount(&server)
            .await;

        let receipt = client(&server)
            .send_media(
                "acme-main",
                "11999990000",
                "https://cdn.example.com/flyer.png",
                MediaType::Image,
                "See you there",
            )
            .await
            .unwrap();
        assert_eq!(receipt.message_id.as_deref(), Some("M1"));
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/message/sendText/acme-main"))
            .respond_with(ResponseTemplate::new(400).set_body_string("number does not exist"))
            .mount(&server)
            .await;

        let err = client(&server)
            .send_text("acme-main", "5511999990000", "Hi")
            .await
            .unwrap_err();
        match err {
            GatewayError::Http { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(body, "number does not exist");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_phone_is_rejected_before_request() {
        let server = MockServer::start().await;
        let err = client(&server)
            .send_text("acme-main", "n/a", "Hi")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidPhone(_)));
    }

    #[tokio::test]
    async fn test_create_instance_reads_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/instance/create"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "instance": {"instanceName": "acme-main", "status": "created"},
                "hash": {"apikey": "inst-token"}
            })))
            .mount(&server)
            .await;

        let descriptor = client(&server)
            .create_instance("acme-main", "https://parley.example.com/webhook/acme-main")
            .await
            .unwrap();
        assert_eq!(
            descriptor,
            InstanceDescriptor {
                instance_name: "acme-main".into(),
                token: Some("inst-token".into()),
            }
        );
    }

    #[tokio::test]
    async fn test_connection_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/instance/connectionState/acme-main"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "instance": {"instanceName": "acme-main", "state": "open"}
            })))
            .mount(&server)
            .await;

        let state = client(&server).connection_state("acme-main").await.unwrap();
        assert!(state.is_open());
    }
}
