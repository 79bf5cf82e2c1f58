//! Sources - ingestion run loops feeding the router
//!
//! A source owns its cancellation token from creation; `run()` returns once
//! the token fires or its input is exhausted.
//!
//! Endpoint checkpoints are a single offset per endpoint, so every source that
//! can reach the same router draws its offsets from one `OffsetSequence`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use eh_common::Message;
use eh_util::{AsyncLock, AtomicLong};
use parking_lot::Mutex;
use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::router::{RouteOutcome, Router};
use crate::{Result, RouterError};

const DEFAULT_PARTITION: &str = "0";

#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &str;

    /// Pull messages and hand them to the router until cancelled
    async fn run(&self) -> Result<()>;
}

#[async_trait]
pub trait SourceFactory: Send + Sync {
    async fn create(
        &self,
        hub_name: &str,
        partition_id: Option<&str>,
        router: Arc<Router>,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn Source>>;
}

// ============================================================================
// Null Source
// ============================================================================

/// Produces nothing; `run` only waits for cancellation
pub struct NullSource {
    name: String,
    cancel: CancellationToken,
}

impl NullSource {
    pub fn new(name: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            name: name.into(),
            cancel,
        }
    }
}

#[async_trait]
impl Source for NullSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> Result<()> {
        self.cancel.cancelled().await;
        debug!(source = %self.name, "Null source stopped");
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSourceFactory;

#[async_trait]
impl SourceFactory for NullSourceFactory {
    async fn create(
        &self,
        hub_name: &str,
        partition_id: Option<&str>,
        _router: Arc<Router>,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn Source>> {
        let name = source_name(hub_name, partition_id);
        Ok(Arc::new(NullSource::new(name, cancel)))
    }
}

// ============================================================================
// Offset Sequence
// ============================================================================

/// Hub-wide message numbering shared by all partitions.
///
/// A message is stamped and routed while the sequence lock is held, so each
/// executor queue receives offsets in increasing order whichever partition
/// they came from.
pub struct OffsetSequence {
    last: AtomicLong,
    lock: AsyncLock,
}

impl OffsetSequence {
    /// The first stamped offset is `last + 1`
    pub fn new(last: i64) -> Self {
        Self {
            last: AtomicLong::new(last),
            lock: AsyncLock::new(),
        }
    }

    /// Last offset handed out
    pub fn last(&self) -> i64 {
        self.last.get()
    }

    /// Stamp the next offset and route the message under the sequence lock
    async fn route(&self, router: &Router, message: Message) -> Result<RouteOutcome> {
        let _guard = self.lock.lock().await?;
        let offset = self.last.increment();
        router.route(message.with_offset(offset)).await
    }
}

// ============================================================================
// Channel Source
// ============================================================================

/// In-process partition fed through an `mpsc` channel
pub struct ChannelSource {
    name: String,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    router: Arc<Router>,
    sequence: Arc<OffsetSequence>,
    cancel: CancellationToken,
}

impl ChannelSource {
    pub fn new(
        name: impl Into<String>,
        receiver: mpsc::Receiver<Message>,
        router: Arc<Router>,
        sequence: Arc<OffsetSequence>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            receiver: tokio::sync::Mutex::new(receiver),
            router,
            sequence,
            cancel,
        }
    }

    /// Last offset handed to the router by any source sharing this sequence
    pub fn offset(&self) -> i64 {
        self.sequence.last()
    }
}

#[async_trait]
impl Source for ChannelSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> Result<()> {
        let mut receiver = self
            .receiver
            .try_lock()
            .map_err(|_| RouterError::source(format!("source {} is already running", self.name)))?;

        info!(source = %self.name, offset = self.offset(), "Source started");

        loop {
            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                message = receiver.recv() => match message {
                    Some(message) => message,
                    None => {
                        debug!(source = %self.name, "Source input closed");
                        break;
                    }
                },
            };

            match self.sequence.route(&self.router, message).await {
                Ok(_) => {}
                Err(RouterError::ShutdownInProgress) => {
                    debug!(source = %self.name, "Router shutting down; source stopping");
                    break;
                }
                Err(e) => {
                    warn!(
                        source = %self.name,
                        offset = self.offset(),
                        error = %e,
                        "Failed to route message"
                    );
                }
            }
        }

        info!(source = %self.name, offset = self.offset(), "Source stopped");
        Ok(())
    }
}

/// Hands out one `ChannelSource` per partition; producers obtain the sending half
/// through `sender()` before or after the source is created. All partitions of
/// one factory share its `OffsetSequence`.
pub struct ChannelSourceFactory {
    capacity: usize,
    initial_offset: i64,
    partitions: Mutex<HashMap<String, Partition>>,
    sequence: OnceCell<Arc<OffsetSequence>>,
}

struct Partition {
    sender: mpsc::Sender<Message>,
    receiver: Option<mpsc::Receiver<Message>>,
}

impl ChannelSourceFactory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            initial_offset: 0,
            partitions: Mutex::new(HashMap::new()),
            sequence: OnceCell::new(),
        }
    }

    /// Offsets start after `offset` unless stored checkpoints are further ahead
    pub fn with_initial_offset(mut self, offset: i64) -> Self {
        self.initial_offset = offset;
        self
    }

    /// Sending half for `partition_id` (default partition when `None`)
    pub fn sender(&self, partition_id: Option<&str>) -> mpsc::Sender<Message> {
        let partition_id = partition_id.unwrap_or(DEFAULT_PARTITION);
        let mut partitions = self.partitions.lock();
        partitions
            .entry(partition_id.to_string())
            .or_insert_with(|| {
                let (sender, receiver) = mpsc::channel(self.capacity);
                Partition {
                    sender,
                    receiver: Some(receiver),
                }
            })
            .sender
            .clone()
    }

    /// Numbering resumes after the furthest stored checkpoint; read once, when
    /// the first partition is created
    async fn sequence(&self, router: &Router) -> Result<Arc<OffsetSequence>> {
        let sequence = self
            .sequence
            .get_or_try_init(|| async {
                let stored = router.checkpoint_store().get_all_checkpoint_data().await?;
                let resume_from = stored
                    .values()
                    .map(|data| data.offset())
                    .fold(self.initial_offset, i64::max);
                info!(resume_from, "Offset sequence initialized");
                Ok::<_, RouterError>(Arc::new(OffsetSequence::new(resume_from)))
            })
            .await?;
        Ok(sequence.clone())
    }

    fn take_receiver(&self, partition_id: &str) -> Option<mpsc::Receiver<Message>> {
        // registers the partition if no producer asked for it yet
        let _ = self.sender(Some(partition_id));
        self.partitions
            .lock()
            .get_mut(partition_id)
            .and_then(|partition| partition.receiver.take())
    }
}

#[async_trait]
impl SourceFactory for ChannelSourceFactory {
    async fn create(
        &self,
        hub_name: &str,
        partition_id: Option<&str>,
        router: Arc<Router>,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn Source>> {
        let partition = partition_id.unwrap_or(DEFAULT_PARTITION);
        let receiver = self
            .take_receiver(partition)
            .ok_or_else(|| RouterError::source(format!("partition {} already has a source", partition)))?;

        let sequence = self.sequence(&router).await?;

        let name = source_name(hub_name, partition_id);
        info!(source = %name, offset = sequence.last(), "Creating channel source");
        Ok(Arc::new(ChannelSource::new(name, receiver, router, sequence, cancel)))
    }
}

fn source_name(hub_name: &str, partition_id: Option<&str>) -> String {
    format!("{}/{}", hub_name, partition_id.unwrap_or(DEFAULT_PARTITION))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::SpecEndpointFactory;
    use crate::executor::EndpointExecutorConfig;
    use eh_checkpoint::{CheckpointStore, InMemoryCheckpointStore};
    use eh_common::{CheckpointData, MessageSource, RouterConfig};
    use std::time::Duration;

    fn test_router(store: Arc<InMemoryCheckpointStore>) -> Arc<Router> {
        Router::new(
            "hub",
            Arc::new(SpecEndpointFactory::new()),
            store,
            EndpointExecutorConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_null_source_waits_for_cancellation() {
        let router = test_router(Arc::new(InMemoryCheckpointStore::new()));
        let cancel = CancellationToken::new();
        let source = NullSourceFactory
            .create("hub", Some("3"), router, cancel.clone())
            .await
            .unwrap();
        assert_eq!(source.name(), "hub/3");

        let handle = tokio::spawn(async move { source.run().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_channel_source_stamps_offsets_after_checkpoints() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        store.set_checkpoint_data("sink", CheckpointData::new(4)).await.unwrap();
        store.set_checkpoint_data("other", CheckpointData::new(9)).await.unwrap();
        let router = test_router(store);
        let config = RouterConfig::from_json(
            r#"{"routes":[{"name":"all","source":"/messages","endpoints":["sink"]}],
                "endpoints":[{"id":"sink","kind":"null"}]}"#,
        )
        .unwrap();
        router.apply_config(&config).await.unwrap();

        let factory = ChannelSourceFactory::new(8).with_initial_offset(2);
        let sender = factory.sender(None);
        let source = factory
            .create("hub", None, router.clone(), CancellationToken::new())
            .await
            .unwrap();

        sender.send(Message::new(MessageSource::TELEMETRY, "one")).await.unwrap();
        sender.send(Message::new(MessageSource::TELEMETRY, "two")).await.unwrap();
        drop(sender);

        // input closed: run returns after draining
        source.run().await.unwrap();
        assert_eq!(router.routed_count(), 2);

        for _ in 0..100 {
            if router.executor_status("sink").map(|s| s.checkpoint.offset()) == Some(11) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sink never checkpointed offset 11");
    }

    #[tokio::test]
    async fn test_channel_source_counts_from_initial_offset() {
        let router = test_router(Arc::new(InMemoryCheckpointStore::new()));
        let (sender, receiver) = mpsc::channel(4);
        let sequence = Arc::new(OffsetSequence::new(41));
        let cancel = CancellationToken::new();
        let source = ChannelSource::new("hub/0", receiver, router, sequence, cancel);

        sender.send(Message::new(MessageSource::TELEMETRY, "a")).await.unwrap();
        sender.send(Message::new(MessageSource::TELEMETRY, "b")).await.unwrap();
        drop(sender);

        source.run().await.unwrap();
        assert_eq!(source.offset(), 43);
    }

    #[tokio::test]
    async fn test_partitions_share_one_offset_sequence() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        store.set_checkpoint_data("sink", CheckpointData::new(3)).await.unwrap();
        let router = test_router(store.clone());
        let config = RouterConfig::from_json(
            r#"{"routes":[{"name":"all","source":"/messages","endpoints":["sink"]}],
                "endpoints":[{"id":"sink","kind":"null"}]}"#,
        )
        .unwrap();
        router.apply_config(&config).await.unwrap();

        let factory = ChannelSourceFactory::new(8);
        let first_sender = factory.sender(Some("p1"));
        let second_sender = factory.sender(Some("p2"));
        let first = factory
            .create("hub", Some("p1"), router.clone(), CancellationToken::new())
            .await
            .unwrap();
        // a later checkpoint does not reset numbering for new partitions
        store.set_checkpoint_data("other", CheckpointData::new(50)).await.unwrap();
        let second = factory
            .create("hub", Some("p2"), router.clone(), CancellationToken::new())
            .await
            .unwrap();

        for body in ["a", "b", "c"] {
            first_sender.send(Message::new(MessageSource::TELEMETRY, body)).await.unwrap();
        }
        drop(first_sender);
        first.run().await.unwrap();

        for body in ["d", "e"] {
            second_sender.send(Message::new(MessageSource::TELEMETRY, body)).await.unwrap();
        }
        drop(second_sender);
        second.run().await.unwrap();

        assert_eq!(router.routed_count(), 5);
        for _ in 0..100 {
            if router.executor_status("sink").map(|s| s.checkpoint.offset()) == Some(8) {
                assert_eq!(router.executor_status("sink").unwrap().skipped, 0);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sink never checkpointed offset 8");
    }

    #[tokio::test]
    async fn test_channel_partition_has_one_source() {
        let router = test_router(Arc::new(InMemoryCheckpointStore::new()));
        let factory = ChannelSourceFactory::new(1);
        let cancel = CancellationToken::new();

        factory.create("hub", Some("1"), router.clone(), cancel.clone()).await.unwrap();
        let second = factory.create("hub", Some("1"), router.clone(), cancel.clone()).await;
        assert!(matches!(second, Err(RouterError::Source(_))));

        factory.create("hub", Some("2"), router, cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_channel_source_stops_when_router_closes() {
        let router = test_router(Arc::new(InMemoryCheckpointStore::new()));
        let factory = ChannelSourceFactory::new(4);
        let sender = factory.sender(Some("p"));
        let source = factory
            .create("hub", Some("p"), router.clone(), CancellationToken::new())
            .await
            .unwrap();

        router.close().await.unwrap();
        sender.send(Message::new(MessageSource::TELEMETRY, "late")).await.unwrap();

        // returns even though the sender is still open
        tokio::time::timeout(Duration::from_secs(1), source.run())
            .await
            .unwrap()
            .unwrap();
    }
}
