//! Router - matches messages against the route table and fans them out
//!
//! The compiled route table lives in an `AtomicReference` and is replaced as a
//! whole on reload; a `route()` call keeps the snapshot it started with.
//! Each endpoint has one `EndpointExecutor`, created when a route table first
//! references it and closed when no route does any more.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use eh_checkpoint::CheckpointStore;
use eh_common::{Message, RouterConfig};
use eh_util::{AsyncLock, AtomicBoolean, AtomicLong, AtomicReference, UtilError};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::endpoint::EndpointFactory;
use crate::executor::{EndpointExecutor, EndpointExecutorConfig, ExecutorEvent, ExecutorStatus, State};
use crate::route::RouteTable;
use crate::router_metrics;
use crate::{Result, RouterError};

/// What happened to one routed message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteOutcome {
    /// Routes whose source and condition matched
    pub matched_routes: usize,
    /// Endpoints the message was queued for
    pub delivered_to: Vec<String>,
    /// Endpoints skipped because they are dead or gone
    pub skipped: Vec<String>,
}

impl RouteOutcome {
    pub fn is_unmatched(&self) -> bool {
        self.matched_routes == 0
    }
}

pub struct Router {
    hub_name: String,
    routes: AtomicReference<RouteTable>,
    executors: DashMap<String, Arc<EndpointExecutor>>,
    dead_endpoints: Arc<DashSet<String>>,
    endpoint_factory: Arc<dyn EndpointFactory>,
    checkpoint_store: Arc<dyn CheckpointStore>,
    executor_config: EndpointExecutorConfig,
    config_lock: AsyncLock,
    events_tx: mpsc::UnboundedSender<ExecutorEvent>,
    events_task: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBoolean,
    routed: AtomicLong,
    unmatched: AtomicLong,
}

impl Router {
    /// Create a router with an empty route table. Must be called inside a tokio runtime.
    pub fn new(
        hub_name: impl Into<String>,
        endpoint_factory: Arc<dyn EndpointFactory>,
        checkpoint_store: Arc<dyn CheckpointStore>,
        executor_config: EndpointExecutorConfig,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dead_endpoints = Arc::new(DashSet::new());
        let events_task = tokio::spawn(watch_executor_events(events_rx, dead_endpoints.clone()));

        Arc::new(Self {
            hub_name: hub_name.into(),
            routes: AtomicReference::new(RouteTable::default()),
            executors: DashMap::new(),
            dead_endpoints,
            endpoint_factory,
            checkpoint_store,
            executor_config,
            config_lock: AsyncLock::new(),
            events_tx,
            events_task: Mutex::new(Some(events_task)),
            running: AtomicBoolean::new(true),
            routed: AtomicLong::new(0),
            unmatched: AtomicLong::new(0),
        })
    }

    pub fn hub_name(&self) -> &str {
        &self.hub_name
    }

    pub fn checkpoint_store(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoint_store
    }

    /// Currently installed route table
    pub fn route_table(&self) -> Arc<RouteTable> {
        self.routes.load()
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Compile and install a new configuration.
    ///
    /// Nothing changes unless every route compiles and every referenced
    /// endpoint can be built.
    pub async fn apply_config(&self, config: &RouterConfig) -> Result<()> {
        if !self.running.get() {
            return Err(RouterError::ShutdownInProgress);
        }
        let _guard = self.config_lock.lock().await?;
        let current = self.routes.load();

        let table = match RouteTable::compile(&config.routes) {
            Ok(table) => table,
            Err(e) => {
                router_metrics::record_config_rejected();
                for (route, problem) in e.compilation_errors() {
                    warn!(route = %route, error = %problem, "Route rejected");
                }
                return Err(e);
            }
        };

        let specs: HashMap<&str, _> = config.endpoints.iter().map(|s| (s.id.as_str(), s)).collect();
        let wanted = table.endpoint_ids();

        // Build executors for new endpoints and replacements for dead ones first,
        // so a failure leaves the running configuration untouched
        let mut created: Vec<Arc<EndpointExecutor>> = Vec::new();
        for id in &wanted {
            let reusable = self
                .executors
                .get(id)
                .map(|executor| !executor.state().is_terminal())
                .unwrap_or(false);
            if reusable {
                continue;
            }

            let started = match self.endpoint_factory.create(id, specs.get(id.as_str()).copied()) {
                Ok(endpoint) => {
                    EndpointExecutor::start(
                        endpoint,
                        self.checkpoint_store.clone(),
                        self.executor_config.clone(),
                        self.events_tx.clone(),
                    )
                    .await
                }
                Err(e) => Err(e),
            };

            match started {
                Ok(executor) => created.push(Arc::new(executor)),
                Err(e) => {
                    error!(
                        endpoint_id = %id,
                        error = %e,
                        "Failed to create endpoint executor; configuration rejected"
                    );
                    router_metrics::record_config_rejected();
                    join_all(created.iter().map(|executor| executor.close())).await;
                    return Err(e);
                }
            }
        }

        let mut replaced = Vec::new();
        for executor in created {
            let id = executor.endpoint_id().to_string();
            self.dead_endpoints.remove(&id);
            if let Some(old) = self.executors.insert(id, executor) {
                replaced.push(old);
            }
        }

        let routes = table.len();
        self.routes
            .compare_and_swap(&current, Arc::new(table))
            .map_err(|conflict| {
                error!("Route table changed while the configuration lock was held");
                RouterError::Concurrency(UtilError::from(conflict))
            })?;
        router_metrics::record_route_table(routes);

        let stale: Vec<String> = self
            .executors
            .iter()
            .filter(|entry| !wanted.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for id in &stale {
            if let Some((_, executor)) = self.executors.remove(id) {
                replaced.push(executor);
            }
            self.dead_endpoints.remove(id);
        }
        join_all(replaced.iter().map(|executor| executor.close())).await;

        info!(
            hub = %self.hub_name,
            routes,
            endpoints = wanted.len(),
            removed = stale.len(),
            "Route table installed"
        );
        Ok(())
    }

    /// Evaluate every route and queue the message once for each matched endpoint
    pub async fn route(&self, message: Message) -> Result<RouteOutcome> {
        if !self.running.get() {
            return Err(RouterError::ShutdownInProgress);
        }
        if message.offset() <= 0 {
            warn!(
                source = %message.source(),
                offset = message.offset(),
                "Rejecting unnumbered message"
            );
            return Err(RouterError::InvalidOffset {
                offset: message.offset(),
            });
        }

        let table = self.routes.load();
        let (matched_routes, targets) = table.matching_endpoints(&message);
        let mut outcome = RouteOutcome {
            matched_routes,
            ..RouteOutcome::default()
        };

        if targets.is_empty() {
            self.unmatched.increment();
            router_metrics::record_unmatched();
            debug!(source = %message.source(), offset = message.offset(), "Message matched no route");
            return Ok(outcome);
        }
        self.routed.increment();
        router_metrics::record_routed();

        let mut deliveries = Vec::with_capacity(targets.len());
        for endpoint_id in targets {
            if self.dead_endpoints.contains(&endpoint_id) {
                warn!(endpoint_id = %endpoint_id, offset = message.offset(), "Skipping dead endpoint");
                router_metrics::record_dead_skip(&endpoint_id);
                outcome.skipped.push(endpoint_id);
                continue;
            }
            let executor = self.executors.get(&endpoint_id).map(|entry| entry.value().clone());
            match executor {
                Some(executor) => deliveries.push((endpoint_id, executor)),
                None => {
                    warn!(endpoint_id = %endpoint_id, "No executor for routed endpoint");
                    outcome.skipped.push(endpoint_id);
                }
            }
        }

        let results = join_all(
            deliveries
                .iter()
                .map(|(_, executor)| executor.invoke(message.clone())),
        )
        .await;

        for ((endpoint_id, _), result) in deliveries.into_iter().zip(results) {
            match result {
                Ok(()) => outcome.delivered_to.push(endpoint_id),
                Err(RouterError::EndpointDead(_)) => {
                    self.dead_endpoints.insert(endpoint_id.clone());
                    router_metrics::record_dead_skip(&endpoint_id);
                    warn!(endpoint_id = %endpoint_id, "Skipping dead endpoint");
                    outcome.skipped.push(endpoint_id);
                }
                Err(e) => {
                    warn!(endpoint_id = %endpoint_id, error = %e, "Failed to queue message for endpoint");
                    outcome.skipped.push(endpoint_id);
                }
            }
        }

        Ok(outcome)
    }

    pub fn executor_status(&self, endpoint_id: &str) -> Option<Arc<ExecutorStatus>> {
        self.executors.get(endpoint_id).map(|executor| executor.status())
    }

    /// Status of every executor, sorted by endpoint id
    pub fn executor_statuses(&self) -> Vec<Arc<ExecutorStatus>> {
        let mut statuses: Vec<_> = self.executors.iter().map(|entry| entry.status()).collect();
        statuses.sort_by(|a, b| a.endpoint_id.cmp(&b.endpoint_id));
        statuses
    }

    pub fn dead_endpoints(&self) -> Vec<String> {
        let mut dead: Vec<String> = self.dead_endpoints.iter().map(|id| id.key().clone()).collect();
        for entry in self.executors.iter() {
            if entry.state() == State::Dead && !dead.contains(entry.key()) {
                dead.push(entry.key().clone());
            }
        }
        dead.sort();
        dead
    }

    pub fn routed_count(&self) -> i64 {
        self.routed.get()
    }

    pub fn unmatched_count(&self) -> i64 {
        self.unmatched.get()
    }

    /// Stop routing, close every executor (flushing final checkpoints), then close the store
    pub async fn close(&self) -> Result<()> {
        if self.running.get_and_set(false) {
            info!(hub = %self.hub_name, "Router shutting down...");
        } else {
            return Ok(());
        }

        let _guard = self.config_lock.lock().await?;
        let executors: Vec<Arc<EndpointExecutor>> =
            self.executors.iter().map(|entry| entry.value().clone()).collect();
        join_all(executors.iter().map(|executor| executor.close())).await;

        if let Some(task) = self.events_task.lock().take() {
            task.abort();
        }

        self.checkpoint_store.close().await?;
        info!(hub = %self.hub_name, executors = executors.len(), "Router closed");
        Ok(())
    }
}

async fn watch_executor_events(
    mut events: mpsc::UnboundedReceiver<ExecutorEvent>,
    dead_endpoints: Arc<DashSet<String>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ExecutorEvent::Dead {
                endpoint_id,
                consecutive_failures,
                last_error,
            } => {
                error!(
                    endpoint_id = %endpoint_id,
                    consecutive_failures,
                    last_error = ?last_error,
                    "Endpoint marked dead; routing to it stopped"
                );
                dead_endpoints.insert(endpoint_id);
            }
            ExecutorEvent::Unhealthy {
                endpoint_id,
                consecutive_failures,
            } => {
                debug!(endpoint_id = %endpoint_id, consecutive_failures, "Endpoint unhealthy");
            }
            ExecutorEvent::Recovered { endpoint_id } => {
                debug!(endpoint_id = %endpoint_id, "Endpoint recovered");
            }
        }
    }
}
