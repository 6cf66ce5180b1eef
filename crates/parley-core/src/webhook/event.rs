//! Gateway webhook events

use crate::gateway::ConnectionState;
use parley_storage::models::{ConnectionChange, DeliveryStatus, PhoneUpdate, SessionStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const DEFAULT_SEND_ERROR: &str = "Unknown error";

/// Envelope of every gateway callback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub instance: Value,
    #[serde(default)]
    pub timestamp: Value,
}

/// `MESSAGES_UPDATE` and `messages.update` are the same event
pub fn normalize_event_type(raw: &str) -> String {
    raw.trim().to_lowercase().replace('_', ".")
}

/// Closed set of events the reconciler understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    QrCodeUpdated,
    ConnectionUpdate {
        state: ConnectionState,
        phone: Option<String>,
    },
    MessageStatus {
        message_id: String,
        status: DeliveryStatus,
    },
    /// The gateway assigned an id to a message we only know by external id
    SendConfirmation {
        gateway_id: String,
        external_id: String,
    },
    Unsupported(String),
}

impl WebhookEvent {
    /// Interpret the `data` object of an event whose type is already normalized
    pub fn parse(event_type: &str, data: &Value) -> Self {
        match event_type {
            "qrcode.updated" => WebhookEvent::QrCodeUpdated,
            "connection.update" => {
                let state = str_at(data, &["/state", "/connection"])
                    .map(ConnectionState::parse)
                    .unwrap_or_else(|| ConnectionState::Other(String::new()));
                WebhookEvent::ConnectionUpdate {
                    state,
                    phone: connected_phone(data),
                }
            }
            "messages.update" => parse_message_status(data),
            "send.message" => {
                match (str_at(data, &["/key/id"]), str_at(data, &["/messageId"])) {
                    (Some(gateway_id), Some(external_id)) => WebhookEvent::SendConfirmation {
                        gateway_id: gateway_id.to_string(),
                        external_id: external_id.to_string(),
                    },
                    _ => WebhookEvent::Unsupported("send.message without ids".into()),
                }
            }
            other => WebhookEvent::Unsupported(other.to_string()),
        }
    }

    /// Session change this event implies, if any
    pub fn connection_change(&self) -> Option<ConnectionChange> {
        match self {
            WebhookEvent::QrCodeUpdated => Some(ConnectionChange {
                status: SessionStatus::Connecting,
                is_healthy: None,
                phone: PhoneUpdate::Keep,
            }),
            WebhookEvent::ConnectionUpdate { state, phone } => match state {
                ConnectionState::Open => Some(ConnectionChange {
                    status: SessionStatus::Connected,
                    is_healthy: Some(true),
                    phone: phone
                        .clone()
                        .map(PhoneUpdate::Set)
                        .unwrap_or(PhoneUpdate::Keep),
                }),
                ConnectionState::Close => Some(ConnectionChange {
                    status: SessionStatus::Disconnected,
                    is_healthy: Some(false),
                    phone: PhoneUpdate::Clear,
                }),
                ConnectionState::Connecting => Some(ConnectionChange {
                    status: SessionStatus::Connecting,
                    is_healthy: None,
                    phone: PhoneUpdate::Keep,
                }),
                ConnectionState::Other(_) => None,
            },
            WebhookEvent::MessageStatus { .. }
            | WebhookEvent::SendConfirmation { .. }
            | WebhookEvent::Unsupported(_) => None,
        }
    }
}

fn parse_message_status(data: &Value) -> WebhookEvent {
    let Some(message_id) = str_at(data, &["/key/id", "/keyId"]) else {
        return WebhookEvent::Unsupported("messages.update without message id".into());
    };
    let raw = str_at(data, &["/status"]).unwrap_or_default().to_lowercase();

    let status = match raw.as_str() {
        "server_ack" => DeliveryStatus::ServerAck,
        "delivery_ack" | "delivered" => DeliveryStatus::Delivered,
        "read" | "played" => DeliveryStatus::Read,
        "error" | "failed" => DeliveryStatus::Failed {
            error: str_at(data, &["/message"])
                .unwrap_or(DEFAULT_SEND_ERROR)
                .to_string(),
        },
        other => return WebhookEvent::Unsupported(format!("messages.update status {:?}", other)),
    };

    WebhookEvent::MessageStatus {
        message_id: message_id.to_string(),
        status,
    }
}

/// Phone number of the connected account, without the `@domain` suffix
fn connected_phone(data: &Value) -> Option<String> {
    str_at(data, &["/wuid", "/instance/wuid", "/connection/wid/user"])
        .and_then(|jid| jid.split('@').next())
        .filter(|phone| !phone.is_empty())
        .map(str::to_string)
}

/// First non-empty string found at any of the JSON pointers
fn str_at<'a>(data: &'a Value, pointers: &[&str]) -> Option<&'a str> {
    pointers
        .iter()
        .filter_map(|p| data.pointer(p).and_then(Value::as_str))
        .find(|s| !s.is_empty())
}
