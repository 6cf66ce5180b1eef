//! Webhook Module - Gateway callback ingestion and status reconciliation
//!
//! Ingestion resolves the owning tenant from the instance id, verifies the
//! signature and stores the raw callback. Reconciliation runs later from the
//! task queue against the stored entry.

mod event;
mod ingest;
mod reconcile;

pub use event::{normalize_event_type, WebhookEnvelope, WebhookEvent};
pub use ingest::{Accepted, IngestError, IngestRequest, WebhookIngestor};
pub use reconcile::{ReconcileOutcome, StatusReconciler};
