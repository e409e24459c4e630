use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::InstanceStore;
use crate::error::Result;
use crate::types::{ResourceId, TrackedInstance};

/// In-process store. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<ResourceId, TrackedInstance>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn get(&self, id: &ResourceId) -> Result<Option<TrackedInstance>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<TrackedInstance>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn put(&self, instance: &TrackedInstance) -> Result<()> {
        self.records
            .write()
            .await
            .insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn remove(&self, id: &ResourceId) -> Result<bool> {
        Ok(self.records.write().await.remove(id).is_some())
    }
}
