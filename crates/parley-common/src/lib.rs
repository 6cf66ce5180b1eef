//! Parley Common - Shared types and utilities
//!
//! This crate provides configuration, the shared error type, identifier
//! aliases, phone normalization and webhook signature helpers used by
//! every Parley component.

pub mod config;
pub mod error;
pub mod phone;
pub mod signature;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
