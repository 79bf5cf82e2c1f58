use std::collections::HashMap;

use async_trait::async_trait;
use eh_common::CheckpointData;

use crate::{CheckpointStore, Result};

/// Store that remembers nothing. Every endpoint starts from offset zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCheckpointStore;

#[async_trait]
impl CheckpointStore for NullCheckpointStore {
    async fn get_checkpoint_data(&self, _id: &str) -> Result<CheckpointData> {
        Ok(CheckpointData::default())
    }

    async fn get_all_checkpoint_data(&self) -> Result<HashMap<String, CheckpointData>> {
        Ok(HashMap::new())
    }

    async fn set_checkpoint_data(&self, _id: &str, _data: CheckpointData) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
