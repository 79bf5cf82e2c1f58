//! In-memory checkpoint store for tests and single-process deployments without persistence

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use eh_common::CheckpointData;
use eh_util::{AtomicBoolean, SyncLock};

use crate::{CheckpointError, CheckpointStore, Result};

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct InMemoryCheckpointStore {
    entries: SyncLock<HashMap<String, CheckpointData>>,
    closed: AtomicBoolean,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::with_entries(HashMap::new())
    }

    /// Pre-seeded store, as if a previous run had checkpointed these endpoints
    pub fn with_entries(entries: HashMap<String, CheckpointData>) -> Self {
        Self {
            entries: SyncLock::new(entries, LOCK_TIMEOUT),
            closed: AtomicBoolean::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.get() {
            return Err(CheckpointError::Closed);
        }
        Ok(())
    }
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get_checkpoint_data(&self, id: &str) -> Result<CheckpointData> {
        self.ensure_open()?;
        Ok(self.entries.lock()?.get(id).copied().unwrap_or_default())
    }

    async fn get_all_checkpoint_data(&self) -> Result<HashMap<String, CheckpointData>> {
        self.ensure_open()?;
        Ok(self.entries.lock()?.clone())
    }

    async fn set_checkpoint_data(&self, id: &str, data: CheckpointData) -> Result<()> {
        self.ensure_open()?;
        self.entries.lock()?.insert(id.to_string(), data);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.set(true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_id_defaults_to_zero() {
        let store = InMemoryCheckpointStore::new();
        let data = store.get_checkpoint_data("unknown").await.unwrap();
        assert_eq!(data, CheckpointData::new(0));
    }

    #[tokio::test]
    async fn test_set_and_get_all() {
        let store = InMemoryCheckpointStore::new();
        store.set_checkpoint_data("a", CheckpointData::new(3)).await.unwrap();
        store.set_checkpoint_data("b", CheckpointData::new(7)).await.unwrap();

        let all = store.get_all_checkpoint_data().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["b"].offset(), 7);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_operations() {
        let store = InMemoryCheckpointStore::new();
        store.close().await.unwrap();
        assert!(store.is_closed());
        assert!(matches!(
            store.set_checkpoint_data("a", CheckpointData::new(1)).await,
            Err(CheckpointError::Closed)
        ));
    }
}
