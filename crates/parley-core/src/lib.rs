//! Parley Core - Campaign dispatch and delivery-status reconciliation
//!
//! This crate provides:
//! - Campaign lifecycle, recipient resolution and the batch dispatch scheduler
//! - The messaging gateway client
//! - Webhook ingestion and status reconciliation
//! - The durable task queue, worker pool and maintenance sweeps

pub mod campaign;
pub mod gateway;
pub mod maintenance;
pub mod queue;
pub mod sessions;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;

pub use campaign::{CampaignError, CampaignManager, DispatchScheduler};
pub use gateway::{GatewayClient, HttpGatewayClient};
pub use maintenance::MaintenanceLoop;
pub use queue::{TaskQueue, TaskRouter, WorkerPool};
pub use sessions::SessionManager;
pub use webhook::{IngestError, StatusReconciler, WebhookIngestor};
