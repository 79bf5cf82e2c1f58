//! Lifecycle Manager - Background tasks for the hub router
//!
//! Handles:
//! - Applying configuration changes pushed by the configuration subsystem
//! - Periodic health reporting (executor states, unmatched messages, dead endpoints)
//! - Graceful shutdown coordination

use std::sync::Arc;
use std::time::Duration;

use eh_common::RouterConfig;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::executor::State;
use crate::router::Router;

/// Configuration for the lifecycle manager
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Interval for health report generation
    pub health_report_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            health_report_interval: Duration::from_secs(60),
        }
    }
}

/// Manages lifecycle tasks for the router
pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LifecycleManager {
    /// Start all lifecycle tasks
    pub fn start(
        router: Arc<Router>,
        config_rx: mpsc::Receiver<RouterConfig>,
        config: LifecycleConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut tasks = Vec::new();

        // Configuration change consumer
        {
            let router = router.clone();
            let mut config_rx = config_rx;
            let mut shutdown_rx = shutdown_tx.subscribe();

            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        update = config_rx.recv() => {
                            let Some(update) = update else {
                                debug!("Configuration channel closed");
                                break;
                            };
                            info!(
                                routes = update.routes.len(),
                                endpoints = update.endpoints.len(),
                                "Applying configuration update"
                            );
                            if let Err(e) = router.apply_config(&update).await {
                                error!(error = %e, "Configuration update rejected; keeping current routes");
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Configuration consumer shutting down");
                            break;
                        }
                    }
                }
            }));
        }

        // Health reporter
        {
            let router = router.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.health_report_interval;

            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                let mut last_unmatched = router.unmatched_count();

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let unmatched = router.unmatched_count();
                            report_health(&router, unmatched - last_unmatched);
                            last_unmatched = unmatched;
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Health reporter shutting down");
                            break;
                        }
                    }
                }
            }));
        }

        info!("Lifecycle manager started with all background tasks");

        Self {
            shutdown_tx,
            tasks: Mutex::new(tasks),
        }
    }

    /// Signal shutdown to all lifecycle tasks and wait for them to stop
    pub async fn shutdown(&self) {
        info!("Initiating lifecycle manager shutdown");
        let _ = self.shutdown_tx.send(());

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Lifecycle task ended abnormally");
            }
        }
    }
}

fn report_health(router: &Router, unmatched_since_last: i64) {
    let statuses = router.executor_statuses();
    let dead = router.dead_endpoints();
    let unhealthy: Vec<&str> = statuses
        .iter()
        .filter(|status| status.state == State::Unhealthy)
        .map(|status| status.endpoint_id.as_str())
        .collect();

    info!(
        hub = %router.hub_name(),
        routes = router.route_table().len(),
        executors = statuses.len(),
        routed_total = router.routed_count(),
        unmatched_total = router.unmatched_count(),
        unmatched_since_last,
        "Router health report"
    );

    for status in &statuses {
        debug!(
            endpoint_id = %status.endpoint_id,
            state = ?status.state,
            offset = status.checkpoint.offset(),
            consecutive_failures = status.consecutive_failures,
            skipped = status.skipped,
            dropped = status.dropped,
            "Executor status"
        );
    }

    if !unhealthy.is_empty() {
        warn!(endpoints = ?unhealthy, "Endpoints unhealthy");
    }
    if !dead.is_empty() {
        error!(endpoints = ?dead, "Endpoints dead; messages for them are skipped until reload");
    }
}
