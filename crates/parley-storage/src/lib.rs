//! Parley Storage - Database access layer
//!
//! Repository traits with PostgreSQL implementations, plus an in-process
//! memory backend implementing the same traits.

pub mod db;
pub mod memory;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use memory::MemoryStore;
pub use models::*;
pub use repository::*;
