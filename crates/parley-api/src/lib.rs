//! Parley API - HTTP surface
//!
//! This crate provides the axum router for gateway webhooks, the campaign
//! control surface, session provisioning and health checks.

pub mod handlers;
pub mod routes;
pub mod state;

pub use routes::create_router;
pub use state::AppState;
