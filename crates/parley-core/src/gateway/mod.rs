//! Messaging gateway client
//!
//! The scheduler and session manager only see the [`GatewayClient`] trait.
//! [`HttpGatewayClient`] talks to an Evolution-style HTTP API.

mod client;

pub use client::HttpGatewayClient;

use async_trait::async_trait;
use parley_common::types::MediaType;
use thiserror::Error;

/// Gateway client errors
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("gateway returned status {status}: {body}")]
    Http { status: u16, body: String },

    #[error("gateway request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected gateway response: {0}")]
    Decode(String),

    #[error("phone number has no digits: {0:?}")]
    InvalidPhone(String),
}

impl From<GatewayError> for parley_common::Error {
    fn from(e: GatewayError) -> Self {
        parley_common::Error::Gateway(e.to_string())
    }
}

/// Instance created on the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescriptor {
    pub instance_name: String,
    /// Per-instance API token, when the gateway issues one
    pub token: Option<String>,
}

/// Result of a successful send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// Gateway-assigned message id, if the response carried one
    pub message_id: Option<String>,
}

/// Connection state reported by the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Connecting,
    Close,
    Other(String),
}

impl ConnectionState {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "open" | "connected" => ConnectionState::Open,
            "connecting" => ConnectionState::Connecting,
            "close" | "closed" | "disconnected" => ConnectionState::Close,
            other => ConnectionState::Other(other.to_string()),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }
}

/// Operations the core needs from the messaging gateway
#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn create_instance(
        &self,
        instance: &str,
        webhook_url: &str,
    ) -> Result<InstanceDescriptor, GatewayError>;

    async fn send_text(
        &self,
        instance: &str,
        phone: &str,
        text: &str,
    ) -> Result<SendReceipt, GatewayError>;

    async fn send_media(
        &self,
        instance: &str,
        phone: &str,
        media_url: &str,
        media_type: MediaType,
        caption: &str,
    ) -> Result<SendReceipt, GatewayError>;

    async fn connection_state(&self, instance: &str) -> Result<ConnectionState, GatewayError>;
}
