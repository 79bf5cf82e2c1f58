//! EdgeHub Checkpoint Storage
//!
//! Durable per-endpoint delivery progress:
//! - CheckpointStore: storage boundary (in-memory, sled, null)
//! - Checkpointer: one endpoint's monotonic view over the store

use std::collections::HashMap;

use async_trait::async_trait;
use eh_common::CheckpointData;
use eh_util::UtilError;
use thiserror::Error;

pub mod checkpointer;
pub mod memory;
pub mod null;
pub mod sled_store;

pub use checkpointer::Checkpointer;
pub use memory::InMemoryCheckpointStore;
pub use null::NullCheckpointStore;
pub use sled_store::SledCheckpointStore;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Lock error: {0}")]
    Lock(#[from] UtilError),

    #[error("Checkpoint store closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Durable record of delivery progress, keyed by endpoint id.
///
/// Writes for different ids may run concurrently; writes for one id are
/// serialised by that endpoint's `Checkpointer`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Stored data, or a zero-offset default when the id has never been written
    async fn get_checkpoint_data(&self, id: &str) -> Result<CheckpointData>;

    async fn get_all_checkpoint_data(&self) -> Result<HashMap<String, CheckpointData>>;

    async fn set_checkpoint_data(&self, id: &str, data: CheckpointData) -> Result<()>;

    /// Flush and release the underlying storage
    async fn close(&self) -> Result<()>;
}
