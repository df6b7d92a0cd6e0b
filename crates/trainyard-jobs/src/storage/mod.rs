//! Job state store: durable job records and the audit log.
//!
//! [`JobStateStore`] is the boundary the orchestrator writes through.
//! [`Database`] implements it on `SQLite`, [`MemoryStore`] in memory.

mod db;
mod memory;
mod models;
mod queries;
mod store;

pub use db::{Database, DatabaseError};
pub use memory::{MemoryStore, StoreWrite};
pub use models::*;
pub use store::JobStateStore;
