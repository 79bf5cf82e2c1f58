//! End-to-end routing: sources feed the router, executors deliver and checkpoint

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eh_checkpoint::{CheckpointStore, InMemoryCheckpointStore, SledCheckpointStore};
use eh_common::{CheckpointData, EndpointSpec, Message, MessageSource, RouteSpec, RouterConfig};
use eh_router::{
    ChannelSourceFactory, CommandKind, Endpoint, EndpointExecutorConfig, EndpointFactory, Router,
    RouterError, SendOutcome, SourceFactory, State,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Wraps a store and records every write
struct RecordingStore {
    inner: InMemoryCheckpointStore,
    writes: Mutex<Vec<(String, CheckpointData)>>,
}

impl RecordingStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryCheckpointStore::new(),
            writes: Mutex::new(Vec::new()),
        })
    }

    fn writes(&self) -> Vec<(String, CheckpointData)> {
        self.writes.lock().clone()
    }
}

#[async_trait]
impl CheckpointStore for RecordingStore {
    async fn get_checkpoint_data(&self, id: &str) -> eh_checkpoint::Result<CheckpointData> {
        self.inner.get_checkpoint_data(id).await
    }

    async fn get_all_checkpoint_data(&self) -> eh_checkpoint::Result<HashMap<String, CheckpointData>> {
        self.inner.get_all_checkpoint_data().await
    }

    async fn set_checkpoint_data(&self, id: &str, data: CheckpointData) -> eh_checkpoint::Result<()> {
        self.writes.lock().push((id.to_string(), data));
        self.inner.set_checkpoint_data(id, data).await
    }

    async fn close(&self) -> eh_checkpoint::Result<()> {
        self.inner.close().await
    }
}

/// Records delivered messages; fails while `down` is set, waits `delay_ms` per send
struct MockEndpoint {
    id: String,
    sends: AtomicUsize,
    delivered: Mutex<Vec<Message>>,
    down: AtomicUsize,
    delay_ms: AtomicU64,
}

impl MockEndpoint {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            sends: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
            down: AtomicUsize::new(0),
            delay_ms: AtomicU64::new(0),
        })
    }

    fn delivered_offsets(&self) -> Vec<i64> {
        self.delivered.lock().iter().map(|m| m.offset()).collect()
    }
}

#[async_trait]
impl Endpoint for MockEndpoint {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, message: &Message) -> SendOutcome {
        self.sends.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.down.load(Ordering::SeqCst) > 0 {
            return SendOutcome::Failed {
                reason: "connection refused".to_string(),
            };
        }
        self.delivered.lock().push(message.clone());
        SendOutcome::Delivered
    }
}

struct MockFactory {
    endpoints: HashMap<String, Arc<MockEndpoint>>,
}

impl MockFactory {
    fn new(ids: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            endpoints: ids.iter().map(|id| (id.to_string(), MockEndpoint::new(id))).collect(),
        })
    }

    fn endpoint(&self, id: &str) -> Arc<MockEndpoint> {
        self.endpoints[id].clone()
    }
}

impl EndpointFactory for MockFactory {
    fn create(&self, id: &str, _spec: Option<&EndpointSpec>) -> eh_router::Result<Arc<dyn Endpoint>> {
        self.endpoints
            .get(id)
            .map(|endpoint| endpoint.clone() as Arc<dyn Endpoint>)
            .ok_or_else(|| RouterError::UnknownEndpoint(id.to_string()))
    }
}

fn fast_config() -> EndpointExecutorConfig {
    EndpointExecutorConfig {
        max_consecutive_failures: 3,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        checkpoint_retry_delay: Duration::from_millis(5),
        queue_capacity: 64,
        shutdown_drain_timeout: Duration::from_secs(5),
    }
}

fn single_route(condition: &str, endpoint: &str) -> RouterConfig {
    RouterConfig {
        routes: vec![RouteSpec::Structured {
            name: "r1".to_string(),
            source: "/messages".to_string(),
            condition: condition.to_string(),
            endpoints: vec![endpoint.to_string()],
        }],
        endpoints: Vec::new(),
    }
}

async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_single_message_is_sent_and_checkpointed_once() {
    let factory = MockFactory::new(&["E"]);
    let store = RecordingStore::new();
    let router = Router::new("hub", factory.clone(), store.clone(), fast_config());
    router.apply_config(&single_route("true", "E")).await.unwrap();

    let sources = ChannelSourceFactory::new(8);
    let sender = sources.sender(None);
    let cancel = CancellationToken::new();
    let source = sources.create("hub", None, router.clone(), cancel.clone()).await.unwrap();
    let running = tokio::spawn(async move { source.run().await });

    sender
        .send(Message::new(MessageSource::TELEMETRY, "{\"temp\":21}"))
        .await
        .unwrap();

    eventually("checkpoint at offset 1", || {
        router.executor_status("E").map(|s| s.checkpoint.offset()) == Some(1)
    })
    .await;

    let endpoint = factory.endpoint("E");
    assert_eq!(endpoint.sends.load(Ordering::SeqCst), 1);
    assert_eq!(endpoint.delivered_offsets(), vec![1]);

    let status = router.executor_status("E").unwrap();
    assert_eq!(status.state, State::Idle);
    let path: Vec<(State, State, CommandKind)> = status
        .recent_transitions
        .iter()
        .map(|t| (t.from, t.to, t.command))
        .collect();
    assert_eq!(
        path,
        vec![
            (State::Idle, State::Sending, CommandKind::Send),
            (State::Sending, State::CheckpointPending, CommandKind::Ack),
            (State::CheckpointPending, State::Idle, CommandKind::Checkpoint),
        ]
    );

    cancel.cancel();
    running.await.unwrap().unwrap();
    router.close().await.unwrap();

    let writes = store.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].0, "E");
    assert_eq!(writes[0].1.offset(), 1);
    assert_eq!(writes[0].1.unhealthy_since(), None);
}

#[tokio::test]
async fn test_conditions_select_endpoints() {
    let factory = MockFactory::new(&["upstream", "alerts", "twin"]);
    let router = Router::new("hub", factory.clone(), Arc::new(InMemoryCheckpointStore::new()), fast_config());
    let config = RouterConfig {
        routes: vec![
            RouteSpec::Statement {
                name: "everything".to_string(),
                statement: "FROM /messages/* INTO upstream".to_string(),
            },
            RouteSpec::Statement {
                name: "hot".to_string(),
                statement: "FROM /messages WHERE $body.reading.temp > 30 AND severity <> 'low' INTO alerts"
                    .to_string(),
            },
            RouteSpec::Structured {
                name: "twin".to_string(),
                source: "/twinChangeNotifications".to_string(),
                condition: "IS_DEFINED($body.properties.reported.firmware)".to_string(),
                endpoints: vec!["twin".to_string()],
            },
        ],
        endpoints: Vec::new(),
    };
    router.apply_config(&config).await.unwrap();

    let hot = Message::builder(MessageSource::TELEMETRY, "{\"reading\":{\"temp\":35}}")
        .system_property("contentType", "application/json; charset=utf-8")
        .property("severity", "high")
        .offset(1)
        .build();
    let cold = Message::builder(MessageSource::module_output("filter", "out1"), "{\"reading\":{\"temp\":10}}")
        .system_property("contentType", "application/json")
        .offset(2)
        .build();
    let twin = Message::builder(
        MessageSource::TWIN_CHANGE_NOTIFICATIONS,
        "{\"properties\":{\"reported\":{\"firmware\":\"1.2\"}}}",
    )
    .offset(3)
    .build();

    assert_eq!(router.route(hot).await.unwrap().matched_routes, 2);
    assert_eq!(router.route(cold).await.unwrap().matched_routes, 1);
    let outcome = router.route(twin).await.unwrap();
    assert_eq!(outcome.delivered_to, vec!["twin".to_string()]);

    let upstream = factory.endpoint("upstream");
    let alerts = factory.endpoint("alerts");
    let twin = factory.endpoint("twin");
    eventually("upstream deliveries", || upstream.delivered_offsets() == vec![1, 2]).await;
    eventually("alert delivery", || alerts.delivered_offsets() == vec![1]).await;
    eventually("twin delivery", || twin.delivered_offsets() == vec![3]).await;
    assert_eq!(router.unmatched_count(), 0);

    router.close().await.unwrap();
}

#[tokio::test]
async fn test_unhealthy_endpoint_recovers_without_losing_messages() {
    let factory = MockFactory::new(&["E"]);
    let config = EndpointExecutorConfig {
        max_consecutive_failures: 10,
        initial_backoff: Duration::from_millis(20),
        ..fast_config()
    };
    let router = Router::new("hub", factory.clone(), Arc::new(InMemoryCheckpointStore::new()), config);
    router.apply_config(&single_route("true", "E")).await.unwrap();

    let endpoint = factory.endpoint("E");
    endpoint.down.store(1, Ordering::SeqCst);
    router
        .route(Message::builder(MessageSource::TELEMETRY, "a").offset(1).build())
        .await
        .unwrap();

    eventually("unhealthy", || {
        router.executor_status("E").map(|s| s.consecutive_failures) >= Some(1)
    })
    .await;
    endpoint.down.store(0, Ordering::SeqCst);

    router
        .route(Message::builder(MessageSource::TELEMETRY, "b").offset(2).build())
        .await
        .unwrap();
    eventually("both delivered in order", || endpoint.delivered_offsets() == vec![1, 2]).await;
    eventually("checkpoint at 2", || {
        router.executor_status("E").map(|s| s.checkpoint.offset()) == Some(2)
    })
    .await;

    let status = router.executor_status("E").unwrap();
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(status.checkpoint.unhealthy_since(), None);
    assert!(router.dead_endpoints().is_empty());

    router.close().await.unwrap();
}

#[tokio::test]
async fn test_restart_resumes_after_durable_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let factory = MockFactory::new(&["E"]);

    {
        let store = Arc::new(SledCheckpointStore::open(dir.path()).unwrap());
        let router = Router::new("hub", factory.clone(), store, fast_config());
        router.apply_config(&single_route("true", "E")).await.unwrap();
        for offset in 1..=3 {
            router
                .route(Message::builder(MessageSource::TELEMETRY, "x").offset(offset).build())
                .await
                .unwrap();
        }
        eventually("checkpoint at 3", || {
            router.executor_status("E").map(|s| s.checkpoint.offset()) == Some(3)
        })
        .await;
        router.close().await.unwrap();
    }

    let store = Arc::new(SledCheckpointStore::open(dir.path()).unwrap());
    assert_eq!(store.get_checkpoint_data("E").await.unwrap().offset(), 3);

    let router = Router::new("hub", factory.clone(), store, fast_config());
    router.apply_config(&single_route("true", "E")).await.unwrap();

    // replayed offsets are skipped, new ones delivered
    for offset in 2..=4 {
        router
            .route(Message::builder(MessageSource::TELEMETRY, "x").offset(offset).build())
            .await
            .unwrap();
    }
    let endpoint = factory.endpoint("E");
    eventually("offset 4 delivered", || endpoint.delivered_offsets() == vec![1, 2, 3, 4]).await;
    eventually("checkpoint at 4", || {
        router.executor_status("E").map(|s| s.checkpoint.offset()) == Some(4)
    })
    .await;
    assert_eq!(router.executor_status("E").unwrap().skipped, 2);

    // a fresh source continues numbering after the stored checkpoint
    let sources = ChannelSourceFactory::new(4);
    let sender = sources.sender(None);
    let source = sources
        .create("hub", None, router.clone(), CancellationToken::new())
        .await
        .unwrap();
    sender.send(Message::new(MessageSource::TELEMETRY, "y")).await.unwrap();
    drop(sender);
    source.run().await.unwrap();
    eventually("offset 5 delivered", || endpoint.delivered_offsets().last() == Some(&5)).await;

    router.close().await.unwrap();
}

#[tokio::test]
async fn test_dead_endpoint_does_not_block_others() {
    let factory = MockFactory::new(&["broken", "healthy"]);
    let router = Router::new("hub", factory.clone(), Arc::new(InMemoryCheckpointStore::new()), fast_config());
    let config = RouterConfig {
        routes: vec![RouteSpec::Structured {
            name: "fanout".to_string(),
            source: "/messages".to_string(),
            condition: "true".to_string(),
            endpoints: vec!["broken".to_string(), "healthy".to_string()],
        }],
        endpoints: Vec::new(),
    };
    router.apply_config(&config).await.unwrap();

    let broken = factory.endpoint("broken");
    broken.down.store(1, Ordering::SeqCst);

    router
        .route(Message::builder(MessageSource::TELEMETRY, "1").offset(1).build())
        .await
        .unwrap();
    eventually("broken endpoint dead", || router.dead_endpoints() == vec!["broken".to_string()]).await;
    assert_eq!(broken.sends.load(Ordering::SeqCst), 3);
    assert_eq!(router.executor_status("broken").unwrap().state, State::Dead);

    let outcome = router
        .route(Message::builder(MessageSource::TELEMETRY, "2").offset(2).build())
        .await
        .unwrap();
    assert_eq!(outcome.skipped, vec!["broken".to_string()]);

    let healthy = factory.endpoint("healthy");
    eventually("healthy endpoint unaffected", || healthy.delivered_offsets() == vec![1, 2]).await;

    router.close().await.unwrap();
}

#[tokio::test]
async fn test_partitions_do_not_reuse_offsets() {
    let factory = MockFactory::new(&["E"]);
    let router = Router::new("hub", factory.clone(), Arc::new(InMemoryCheckpointStore::new()), fast_config());
    router.apply_config(&single_route("true", "E")).await.unwrap();

    let sources = ChannelSourceFactory::new(8);
    let p1 = sources.sender(Some("p1"));
    let p2 = sources.sender(Some("p2"));
    let cancel = CancellationToken::new();
    let first = sources.create("hub", Some("p1"), router.clone(), cancel.clone()).await.unwrap();
    let second = sources.create("hub", Some("p2"), router.clone(), cancel.clone()).await.unwrap();
    let first = tokio::spawn(async move { first.run().await });
    let second = tokio::spawn(async move { second.run().await });

    for body in ["p1-a", "p1-b", "p1-c"] {
        p1.send(Message::new(MessageSource::TELEMETRY, body)).await.unwrap();
    }
    let endpoint = factory.endpoint("E");
    eventually("first partition delivered", || endpoint.sends.load(Ordering::SeqCst) == 3).await;
    for body in ["p2-a", "p2-b"] {
        p2.send(Message::new(MessageSource::TELEMETRY, body)).await.unwrap();
    }

    eventually("checkpoint at 5", || {
        router.executor_status("E").map(|s| s.checkpoint.offset()) == Some(5)
    })
    .await;
    assert_eq!(endpoint.sends.load(Ordering::SeqCst), 5);
    assert_eq!(endpoint.delivered_offsets(), vec![1, 2, 3, 4, 5]);
    assert_eq!(router.executor_status("E").unwrap().skipped, 0);

    cancel.cancel();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    router.close().await.unwrap();
    assert_eq!(router.executor_status("E").unwrap().checkpoint.offset(), 5);
}

#[tokio::test]
async fn test_unnumbered_message_is_refused() {
    let factory = MockFactory::new(&["E"]);
    let router = Router::new("hub", factory.clone(), Arc::new(InMemoryCheckpointStore::new()), fast_config());
    router.apply_config(&single_route("true", "E")).await.unwrap();

    let result = router.route(Message::new(MessageSource::TELEMETRY, "x")).await;
    assert!(matches!(result, Err(RouterError::InvalidOffset { offset: 0 })));

    router
        .route(Message::builder(MessageSource::TELEMETRY, "y").offset(1).build())
        .await
        .unwrap();
    let endpoint = factory.endpoint("E");
    eventually("numbered message delivered", || endpoint.delivered_offsets() == vec![1]).await;
    assert_eq!(endpoint.sends.load(Ordering::SeqCst), 1);

    router.close().await.unwrap();
}

#[tokio::test]
async fn test_close_delivers_queued_messages() {
    let factory = MockFactory::new(&["E"]);
    let store = RecordingStore::new();
    let router = Router::new("hub", factory.clone(), store.clone(), fast_config());
    router.apply_config(&single_route("true", "E")).await.unwrap();

    let endpoint = factory.endpoint("E");
    endpoint.delay_ms.store(50, Ordering::SeqCst);
    for offset in 1..=5 {
        let outcome = router
            .route(Message::builder(MessageSource::TELEMETRY, "x").offset(offset).build())
            .await
            .unwrap();
        assert_eq!(outcome.delivered_to, vec!["E".to_string()]);
    }

    router.close().await.unwrap();

    assert_eq!(endpoint.sends.load(Ordering::SeqCst), 5);
    assert_eq!(endpoint.delivered_offsets(), vec![1, 2, 3, 4, 5]);
    let status = router.executor_status("E").unwrap();
    assert_eq!(status.state, State::Closed);
    assert_eq!(status.dropped, 0);
    assert_eq!(status.checkpoint.offset(), 5);
    assert_eq!(store.writes().last().map(|(_, data)| data.offset()), Some(5));
}

#[tokio::test]
async fn test_close_counts_messages_left_behind_by_a_failing_endpoint() {
    let factory = MockFactory::new(&["E"]);
    let config = EndpointExecutorConfig {
        max_consecutive_failures: 10,
        initial_backoff: Duration::from_secs(5),
        max_backoff: Duration::from_secs(5),
        ..fast_config()
    };
    let router = Router::new("hub", factory.clone(), Arc::new(InMemoryCheckpointStore::new()), config);
    router.apply_config(&single_route("true", "E")).await.unwrap();

    let endpoint = factory.endpoint("E");
    endpoint.down.store(1, Ordering::SeqCst);
    for offset in 1..=4 {
        router
            .route(Message::builder(MessageSource::TELEMETRY, "x").offset(offset).build())
            .await
            .unwrap();
    }
    eventually("endpoint unhealthy", || {
        router.executor_status("E").map(|s| s.state) == Some(State::Unhealthy)
    })
    .await;

    // close interrupts the revival wait instead of sitting out the backoff
    tokio::time::timeout(Duration::from_secs(2), router.close())
        .await
        .unwrap()
        .unwrap();

    let status = router.executor_status("E").unwrap();
    assert_eq!(status.state, State::Closed);
    assert_eq!(status.dropped, 4);
    assert_eq!(endpoint.sends.load(Ordering::SeqCst), 1);
    assert_eq!(status.checkpoint.offset(), 0);
}
