//! Endpoint Executor - single-writer driver around the delivery state machine
//!
//! Each executor owns one worker task that pulls messages from a bounded
//! queue and feeds them through its `StateMachine` one at a time. Only the
//! worker mutates the machine, so transitions for an endpoint never overlap.
//! Readers see a status snapshot published through an `AtomicReference`.

mod state_machine;

use std::sync::Arc;
use std::time::{Duration, Instant};

use eh_checkpoint::{CheckpointStore, Checkpointer};
use eh_common::{CheckpointData, Message};
use eh_util::AtomicReference;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::endpoint::Endpoint;
use crate::router_metrics;
use crate::{Result, RouterError};

pub use state_machine::{Command, CommandKind, State, StateMachine, TransitionRecord};

const DEFAULT_INITIAL_BACKOFF_MS: u64 = 5000;
const DEFAULT_MAX_BACKOFF_MS: u64 = 60000;
const BACKOFF_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone)]
pub struct EndpointExecutorConfig {
    /// Consecutive failures after which the endpoint is declared dead
    pub max_consecutive_failures: u32,
    /// Delay before the first revival attempt
    pub initial_backoff: Duration,
    /// Upper bound for the revival delay
    pub max_backoff: Duration,
    /// Delay between checkpoint write retries
    pub checkpoint_retry_delay: Duration,
    /// Messages buffered per endpoint before `invoke` waits
    pub queue_capacity: usize,
    /// How long `close` keeps delivering queued messages before dropping the rest
    pub shutdown_drain_timeout: Duration,
}

impl Default for EndpointExecutorConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 10,
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            checkpoint_retry_delay: Duration::from_secs(1),
            queue_capacity: 1000,
            shutdown_drain_timeout: Duration::from_secs(10),
        }
    }
}

impl EndpointExecutorConfig {
    /// `initial * 2^(failures-1)`, capped at `max_backoff`
    pub fn backoff_for(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(32) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * BACKOFF_MULTIPLIER.powi(exponent);
        Duration::from_millis(millis.min(self.max_backoff.as_millis() as f64) as u64)
    }
}

/// Health changes reported to the router
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorEvent {
    Unhealthy {
        endpoint_id: String,
        consecutive_failures: u32,
    },
    Recovered {
        endpoint_id: String,
    },
    Dead {
        endpoint_id: String,
        consecutive_failures: u32,
        last_error: Option<String>,
    },
}

impl ExecutorEvent {
    pub fn endpoint_id(&self) -> &str {
        match self {
            ExecutorEvent::Unhealthy { endpoint_id, .. }
            | ExecutorEvent::Recovered { endpoint_id }
            | ExecutorEvent::Dead { endpoint_id, .. } => endpoint_id,
        }
    }
}

/// Point-in-time view of an executor
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStatus {
    pub endpoint_id: String,
    pub state: State,
    pub checkpoint: CheckpointData,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub recent_transitions: Vec<TransitionRecord>,
    /// Messages not delivered because the checkpoint was already past them
    pub skipped: u64,
    /// Queued messages discarded when the executor died or closed
    pub dropped: u64,
}

impl ExecutorStatus {
    fn capture(machine: &StateMachine) -> Self {
        Self {
            endpoint_id: machine.endpoint_id().to_string(),
            state: machine.state(),
            checkpoint: machine.checkpointer().checkpoint_data(),
            consecutive_failures: machine.consecutive_failures(),
            last_error: machine.last_error().map(str::to_string),
            recent_transitions: machine.history().copied().collect(),
            skipped: 0,
            dropped: 0,
        }
    }
}

pub struct EndpointExecutor {
    endpoint_id: String,
    sender: mpsc::Sender<Message>,
    status: Arc<AtomicReference<ExecutorStatus>>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EndpointExecutor {
    /// Load the endpoint's checkpoint and start its worker
    pub async fn start(
        endpoint: Arc<dyn Endpoint>,
        store: Arc<dyn CheckpointStore>,
        config: EndpointExecutorConfig,
        events: mpsc::UnboundedSender<ExecutorEvent>,
    ) -> Result<Self> {
        let endpoint_id = endpoint.id().to_string();
        let checkpointer = Arc::new(Checkpointer::create(endpoint_id.clone(), store).await?);
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let drain_timeout = config.shutdown_drain_timeout;
        let machine = StateMachine::new(endpoint, checkpointer, config, Some(events));

        let status = Arc::new(AtomicReference::new(ExecutorStatus::capture(&machine)));
        let shutdown = CancellationToken::new();

        info!(
            endpoint_id = %endpoint_id,
            offset = machine.checkpointer().offset(),
            "Starting endpoint executor"
        );

        let worker = Worker {
            machine,
            status: status.clone(),
            shutdown: shutdown.clone(),
            drain_timeout,
            skipped: 0,
            dropped: 0,
        };
        let handle = tokio::spawn(worker.run(receiver));

        Ok(Self {
            endpoint_id,
            sender,
            status,
            shutdown,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    /// Queue a message for delivery; waits while the queue is full
    pub async fn invoke(&self, message: Message) -> Result<()> {
        match self.state() {
            State::Dead => return Err(RouterError::EndpointDead(self.endpoint_id.clone())),
            State::Closed => return Err(RouterError::ExecutorClosed(self.endpoint_id.clone())),
            _ => {}
        }
        if self.shutdown.is_cancelled() {
            return Err(RouterError::ExecutorClosed(self.endpoint_id.clone()));
        }
        self.sender.send(message).await.map_err(|_| match self.state() {
            State::Dead => RouterError::EndpointDead(self.endpoint_id.clone()),
            _ => RouterError::ExecutorClosed(self.endpoint_id.clone()),
        })
    }

    pub fn status(&self) -> Arc<ExecutorStatus> {
        self.status.load()
    }

    pub fn state(&self) -> State {
        self.status.load().state
    }

    /// Messages waiting in the queue
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Stop accepting messages, deliver what is already queued, then flush the
    /// final checkpoint.
    ///
    /// Queued messages are delivered while the endpoint stays healthy and the
    /// drain timeout has not passed; an in-flight send is never interrupted.
    /// Whatever is left after that is dropped, logged and counted in
    /// `ExecutorStatus::dropped`.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(endpoint_id = %self.endpoint_id, error = %e, "Executor worker panicked");
            }
        }
    }
}

struct Worker {
    machine: StateMachine,
    status: Arc<AtomicReference<ExecutorStatus>>,
    shutdown: CancellationToken,
    drain_timeout: Duration,
    skipped: u64,
    dropped: u64,
}

impl Worker {
    async fn run(mut self, mut receiver: mpsc::Receiver<Message>) {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                message = receiver.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            self.process(message).await;

            if self.machine.state() == State::Dead {
                receiver.close();
                let mut dropped = 0usize;
                while receiver.try_recv().is_ok() {
                    dropped += 1;
                }
                if dropped > 0 {
                    warn!(
                        endpoint_id = %self.machine.endpoint_id(),
                        dropped,
                        "Dead endpoint left queued messages undelivered"
                    );
                    self.record_dropped(dropped);
                }
                self.publish();
                return;
            }
        }

        self.drain(&mut receiver).await;

        if let Err(e) = self.machine.handle(Command::Close).await {
            warn!(endpoint_id = %self.machine.endpoint_id(), error = %e, "Close failed");
        }
        self.publish();
    }

    /// Deliver queued messages after shutdown while the endpoint keeps up
    async fn drain(&mut self, receiver: &mut mpsc::Receiver<Message>) {
        receiver.close();
        let deadline = Instant::now() + self.drain_timeout;
        let mut delivered = 0usize;
        // a revival cut short by shutdown leaves its message undelivered
        let mut dropped = usize::from(self.machine.state() == State::Unhealthy);

        while let Ok(message) = receiver.try_recv() {
            if self.machine.state() != State::Idle || Instant::now() >= deadline {
                dropped += 1;
                continue;
            }
            self.process(message).await;
            match self.machine.state() {
                State::Unhealthy | State::Dead => dropped += 1,
                _ => delivered += 1,
            }
        }

        if delivered > 0 {
            info!(
                endpoint_id = %self.machine.endpoint_id(),
                delivered,
                "Delivered queued messages before closing"
            );
        }
        if dropped > 0 {
            warn!(
                endpoint_id = %self.machine.endpoint_id(),
                dropped,
                state = ?self.machine.state(),
                drain_timeout_ms = self.drain_timeout.as_millis() as u64,
                "Closing with undelivered messages"
            );
            self.record_dropped(dropped);
        }
    }

    /// Drive one message until it is checkpointed, the endpoint dies, or shutdown interrupts
    async fn process(&mut self, message: Message) {
        let offset = message.offset();
        if !self.machine.checkpointer().admit(offset) {
            warn!(
                endpoint_id = %self.machine.endpoint_id(),
                offset,
                durable = self.machine.checkpointer().offset(),
                "Skipping message at or below the durable checkpoint"
            );
            router_metrics::record_skipped(self.machine.endpoint_id());
            self.skipped += 1;
            self.publish();
            return;
        }

        let mut next = Some(Command::Send(message));
        while let Some(command) = next.take() {
            let retry = matches!(command, Command::Checkpoint(_)).then(|| command.clone());

            match self.machine.handle(command).await {
                Ok(follow_up) => {
                    self.publish();
                    next = follow_up;
                }
                Err(RouterError::Checkpoint(_)) if retry.is_some() => {
                    if !self.pause(self.machine.checkpoint_retry_delay()).await {
                        return;
                    }
                    next = retry;
                    continue;
                }
                Err(e) => {
                    error!(
                        endpoint_id = %self.machine.endpoint_id(),
                        offset,
                        error = %e,
                        "Executor command failed"
                    );
                    return;
                }
            }

            if next.is_none() && self.machine.state() == State::Unhealthy {
                let delay = self.machine.backoff();
                debug!(
                    endpoint_id = %self.machine.endpoint_id(),
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling revival"
                );
                if !self.pause(delay).await {
                    return;
                }
                next = Some(Command::Revive);
            }
        }
    }

    /// Sleep unless shutdown arrives first; false if interrupted
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn record_dropped(&mut self, count: usize) {
        router_metrics::record_dropped(self.machine.endpoint_id(), count);
        self.dropped += count as u64;
    }

    fn publish(&self) {
        let mut status = ExecutorStatus::capture(&self.machine);
        status.skipped = self.skipped;
        status.dropped = self.dropped;
        self.status.store(Arc::new(status));
    }
}
