//! Checkpointer - one endpoint's monotonic view of the checkpoint store
//!
//! - Offsets only move forward; commits below the durable offset are ignored
//! - Identical commits are skipped without touching storage
//! - Store writes for the endpoint are serialised through an AsyncLock

use std::sync::Arc;
use std::time::Instant;

use eh_common::CheckpointData;
use eh_util::{AsyncLock, AtomicBoolean, AtomicLong, AtomicReference};
use tracing::debug;

use crate::{CheckpointError, CheckpointStore, Result};

pub struct Checkpointer {
    id: String,
    store: Arc<dyn CheckpointStore>,
    offset: AtomicLong,
    data: AtomicReference<CheckpointData>,
    write_lock: AsyncLock,
    closed: AtomicBoolean,
}

impl Checkpointer {
    /// Load the endpoint's stored progress and wrap it
    pub async fn create(id: impl Into<String>, store: Arc<dyn CheckpointStore>) -> Result<Self> {
        let id = id.into();
        let start = Instant::now();
        let loaded = store.get_checkpoint_data(&id).await;
        record_latency("get", start, loaded.is_ok());
        let data = loaded?;
        debug!(endpoint_id = %id, offset = data.offset(), "Loaded checkpoint");
        Ok(Self::with_data(id, store, data))
    }

    pub fn with_data(id: impl Into<String>, store: Arc<dyn CheckpointStore>, data: CheckpointData) -> Self {
        Self {
            id: id.into(),
            store,
            offset: AtomicLong::new(data.offset()),
            data: AtomicReference::new(data),
            write_lock: AsyncLock::new(),
            closed: AtomicBoolean::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Durable offset
    pub fn offset(&self) -> i64 {
        self.offset.get()
    }

    /// Last durably written checkpoint
    pub fn checkpoint_data(&self) -> CheckpointData {
        *self.data.load()
    }

    /// True if a message at `offset` has not been checkpointed yet
    pub fn admit(&self, offset: i64) -> bool {
        offset > self.offset.get()
    }

    /// Persist `data` unless it would move the offset backwards or changes nothing.
    ///
    /// Returns whether the store was written. A failed write leaves the durable
    /// view untouched so the caller can retry the same commit.
    pub async fn commit(&self, data: CheckpointData) -> Result<bool> {
        if self.closed.get() {
            return Err(CheckpointError::Closed);
        }

        let _guard = self.write_lock.lock().await?;
        let current = self.data.load();

        if data.offset() < current.offset() {
            debug!(
                endpoint_id = %self.id,
                durable = current.offset(),
                proposed = data.offset(),
                "Ignoring checkpoint behind durable offset"
            );
            return Ok(false);
        }
        if data == *current {
            return Ok(false);
        }

        let start = Instant::now();
        let written = self.store.set_checkpoint_data(&self.id, data).await;
        record_latency("set", start, written.is_ok());
        written?;

        self.data.store(Arc::new(data));
        self.offset.advance_to(data.offset());
        debug!(endpoint_id = %self.id, offset = data.offset(), "Checkpoint committed");
        Ok(true)
    }

    /// Stop accepting commits. The shared store stays open.
    pub fn close(&self) {
        self.closed.set(true);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }
}

fn record_latency(operation: &'static str, start: Instant, ok: bool) {
    let status = if ok { "success" } else { "failure" };
    metrics::histogram!(
        "edgehub_checkpoint_latency_ms",
        "operation" => operation,
        "status" => status
    )
    .record(start.elapsed().as_secs_f64() * 1000.0);
}
