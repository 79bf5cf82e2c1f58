//! Checkpoint store backed by `sled`
//!
//! Each endpoint's checkpoint is one JSON value in the `checkpoints` tree,
//! keyed by endpoint id. Every write is flushed before it is acknowledged.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use eh_common::CheckpointData;
use eh_util::AtomicBoolean;
use sled::{Db, Tree};
use tracing::{info, warn};

use crate::{CheckpointError, CheckpointStore, Result};

const CHECKPOINT_TREE: &str = "checkpoints";

pub struct SledCheckpointStore {
    db: Db,
    tree: Tree,
    closed: AtomicBoolean,
}

impl SledCheckpointStore {
    /// Open or create the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        let tree = db.open_tree(CHECKPOINT_TREE)?;
        info!(
            path = %path.as_ref().display(),
            entries = tree.len(),
            "Opened checkpoint store"
        );
        Ok(Self {
            db,
            tree,
            closed: AtomicBoolean::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.get() {
            return Err(CheckpointError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for SledCheckpointStore {
    async fn get_checkpoint_data(&self, id: &str) -> Result<CheckpointData> {
        self.ensure_open()?;
        match self.tree.get(id.as_bytes())? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Ok(CheckpointData::default()),
        }
    }

    async fn get_all_checkpoint_data(&self) -> Result<HashMap<String, CheckpointData>> {
        self.ensure_open()?;
        let mut all = HashMap::new();
        for entry in self.tree.iter() {
            let (key, raw) = entry?;
            let id = match std::str::from_utf8(&key) {
                Ok(id) => id.to_string(),
                Err(e) => {
                    warn!(error = %e, "Skipping checkpoint with non UTF-8 key");
                    continue;
                }
            };
            all.insert(id, serde_json::from_slice(&raw)?);
        }
        Ok(all)
    }

    async fn set_checkpoint_data(&self, id: &str, data: CheckpointData) -> Result<()> {
        self.ensure_open()?;
        let raw = serde_json::to_vec(&data)?;
        self.tree.insert(id.as_bytes(), raw)?;
        self.tree.flush_async().await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.get_and_set(true) {
            return Ok(());
        }
        self.db.flush_async().await?;
        info!("Checkpoint store closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn test_checkpoints_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let unhealthy_since = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();

        {
            let store = SledCheckpointStore::open(dir.path()).unwrap();
            store.set_checkpoint_data("upstream", CheckpointData::new(12)).await.unwrap();
            store
                .set_checkpoint_data("alerts", CheckpointData::with_health(4, None, Some(unhealthy_since)))
                .await
                .unwrap();
            store.close().await.unwrap();
        }

        let store = SledCheckpointStore::open(dir.path()).unwrap();
        assert_eq!(store.get_checkpoint_data("upstream").await.unwrap().offset(), 12);
        assert_eq!(store.get_checkpoint_data("missing").await.unwrap().offset(), 0);

        let all = store.get_all_checkpoint_data().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["alerts"].unhealthy_since(), Some(unhealthy_since));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledCheckpointStore::open(dir.path()).unwrap();
        store.close().await.unwrap();
        store.close().await.unwrap();
        assert!(matches!(
            store.set_checkpoint_data("a", CheckpointData::new(1)).await,
            Err(CheckpointError::Closed)
        ));
    }
}
