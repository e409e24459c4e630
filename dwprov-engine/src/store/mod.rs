//! Tracking store for [`TrackedInstance`] records.
//!
//! The lifecycle controller is the only writer. Records are keyed by
//! identifier; each identifier has at most one record.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ResourceId, TrackedInstance};

/// Store trait for tracked instance records.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Get a record by identifier.
    async fn get(&self, id: &ResourceId) -> Result<Option<TrackedInstance>>;

    /// List all records, ordered by identifier.
    async fn list(&self) -> Result<Vec<TrackedInstance>>;

    /// Insert or replace the record for `instance.id`.
    async fn put(&self, instance: &TrackedInstance) -> Result<()>;

    /// Remove a record. Returns whether one existed.
    async fn remove(&self, id: &ResourceId) -> Result<bool>;
}
