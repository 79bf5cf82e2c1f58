//! Endpoint delivery state machine
//!
//! Transitions are looked up in a table keyed by `(state, command)`. Each
//! `handle` call runs in three phases:
//!
//! 1. command effect that must succeed before the state may change
//!    (e.g. persisting a checkpoint); on error the state is left as it was
//! 2. exit action of the old state, state change, enter action of the new state
//! 3. command effect that follows the change (e.g. dispatching the message),
//!    which may yield a follow-up command for the driver
//!
//! Health bookkeeping lives in the enter/exit actions so it holds no matter
//! which command caused the transition.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use eh_checkpoint::Checkpointer;
use eh_common::{CheckpointData, Message};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::endpoint::{Endpoint, SendOutcome};
use crate::router_metrics;
use crate::{Result, RouterError};

use super::{EndpointExecutorConfig, ExecutorEvent};

const HISTORY_LIMIT: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum State {
    Idle,
    Sending,
    CheckpointPending,
    /// Delivery failed; a revival is scheduled
    Unhealthy,
    /// Too many consecutive failures; terminal
    Dead,
    /// Shut down; terminal
    Closed,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Dead | State::Closed)
    }
}

#[derive(Debug, Clone)]
pub enum Command {
    Send(Message),
    Ack(bool),
    Fail(String),
    Checkpoint(i64),
    Close,
    Revive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CommandKind {
    Send,
    Ack,
    Fail,
    Checkpoint,
    Close,
    Revive,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Send(_) => CommandKind::Send,
            Command::Ack(_) => CommandKind::Ack,
            Command::Fail(_) => CommandKind::Fail,
            Command::Checkpoint(_) => CommandKind::Checkpoint,
            Command::Close => CommandKind::Close,
            Command::Revive => CommandKind::Revive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct StateCommandPair {
    state: State,
    command: CommandKind,
}

impl StateCommandPair {
    fn new(state: State, command: CommandKind) -> Self {
        Self { state, command }
    }
}

#[derive(Debug, Clone, Copy)]
enum Target {
    To(State),
    /// Ack(true) moves on to CheckpointPending; Ack(false) counts as a failure
    Acknowledged,
    /// Unhealthy, or Dead once the failure threshold is reached
    Escalate,
}

fn transition_table() -> HashMap<StateCommandPair, Target> {
    let mut table = HashMap::new();
    table.insert(StateCommandPair::new(State::Idle, CommandKind::Send), Target::To(State::Sending));
    table.insert(StateCommandPair::new(State::Sending, CommandKind::Ack), Target::Acknowledged);
    table.insert(StateCommandPair::new(State::Sending, CommandKind::Fail), Target::Escalate);
    table.insert(
        StateCommandPair::new(State::CheckpointPending, CommandKind::Checkpoint),
        Target::To(State::Idle),
    );
    table.insert(StateCommandPair::new(State::Unhealthy, CommandKind::Revive), Target::To(State::Sending));
    table.insert(StateCommandPair::new(State::Unhealthy, CommandKind::Fail), Target::Escalate);
    for state in [State::Idle, State::Sending, State::CheckpointPending, State::Unhealthy] {
        table.insert(StateCommandPair::new(state, CommandKind::Close), Target::To(State::Closed));
    }
    table
}

/// One applied transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransitionRecord {
    pub from: State,
    pub to: State,
    pub command: CommandKind,
}

pub struct StateMachine {
    endpoint: Arc<dyn Endpoint>,
    checkpointer: Arc<Checkpointer>,
    config: EndpointExecutorConfig,
    events: Option<mpsc::UnboundedSender<ExecutorEvent>>,
    transitions: HashMap<StateCommandPair, Target>,
    state: State,
    /// Message being delivered or waiting for a revival
    current: Option<Message>,
    /// Acknowledged offset not yet checkpointed
    pending_offset: Option<i64>,
    consecutive_failures: u32,
    unhealthy_since: Option<DateTime<Utc>>,
    last_failed_revival_time: Option<DateTime<Utc>>,
    reviving: bool,
    last_error: Option<String>,
    history: VecDeque<TransitionRecord>,
}

impl StateMachine {
    pub fn new(
        endpoint: Arc<dyn Endpoint>,
        checkpointer: Arc<Checkpointer>,
        config: EndpointExecutorConfig,
        events: Option<mpsc::UnboundedSender<ExecutorEvent>>,
    ) -> Self {
        let stored = checkpointer.checkpoint_data();
        Self {
            endpoint,
            checkpointer,
            config,
            events,
            transitions: transition_table(),
            state: State::Idle,
            current: None,
            pending_offset: None,
            consecutive_failures: 0,
            unhealthy_since: stored.unhealthy_since(),
            last_failed_revival_time: stored.last_failed_revival_time(),
            reviving: false,
            last_error: None,
            history: VecDeque::with_capacity(HISTORY_LIMIT),
        }
    }

    pub fn endpoint_id(&self) -> &str {
        self.endpoint.id()
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn checkpointer(&self) -> &Arc<Checkpointer> {
        &self.checkpointer
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn unhealthy_since(&self) -> Option<DateTime<Utc>> {
        self.unhealthy_since
    }

    pub fn last_failed_revival_time(&self) -> Option<DateTime<Utc>> {
        self.last_failed_revival_time
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn history(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.history.iter()
    }

    pub fn checkpoint_retry_delay(&self) -> Duration {
        self.config.checkpoint_retry_delay
    }

    /// Delay before the next revival attempt
    pub fn backoff(&self) -> Duration {
        self.config.backoff_for(self.consecutive_failures)
    }

    /// Apply one command. Returns the command the driver should issue next, if any.
    pub async fn handle(&mut self, command: Command) -> Result<Option<Command>> {
        let kind = command.kind();

        match (self.state, kind) {
            (State::Dead | State::Closed, CommandKind::Close) => return Ok(None),
            (State::Dead, CommandKind::Send) => {
                return Err(RouterError::EndpointDead(self.endpoint.id().to_string()))
            }
            (State::Closed, CommandKind::Send) => {
                return Err(RouterError::ExecutorClosed(self.endpoint.id().to_string()))
            }
            _ => {}
        }

        let target = self
            .transitions
            .get(&StateCommandPair::new(self.state, kind))
            .copied()
            .ok_or(RouterError::InvalidTransition {
                state: self.state,
                command: kind,
            })?;
        let to = self.resolve(target, &command);

        self.before_transition(&command).await?;

        let from = self.state;
        if from != to {
            self.exit(from);
        }
        self.state = to;
        self.enter(to).await;
        self.record(from, to, kind);

        Ok(self.after_transition(command, to).await)
    }

    fn resolve(&self, target: Target, command: &Command) -> State {
        match (target, command) {
            (Target::To(state), _) => state,
            (Target::Acknowledged, Command::Ack(true)) => State::CheckpointPending,
            (Target::Acknowledged, _) | (Target::Escalate, _) => {
                if self.consecutive_failures + 1 >= self.config.max_consecutive_failures {
                    State::Dead
                } else {
                    State::Unhealthy
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Command effects
    // ------------------------------------------------------------------------

    async fn before_transition(&mut self, command: &Command) -> Result<()> {
        match command {
            Command::Send(message) => {
                self.current = Some(message.clone());
            }
            Command::Ack(true) => {
                self.consecutive_failures = 0;
                self.last_error = None;
                self.pending_offset = self.current.as_ref().map(Message::offset);
            }
            Command::Ack(false) => {
                self.record_failure("endpoint returned a negative acknowledgement".to_string());
            }
            Command::Fail(reason) => {
                self.record_failure(reason.clone());
            }
            Command::Checkpoint(offset) => {
                let data = self.checkpoint_data(*offset);
                if let Err(e) = self.checkpointer.commit(data).await {
                    warn!(
                        endpoint_id = %self.endpoint.id(),
                        offset = *offset,
                        error = %e,
                        retry_delay_ms = self.config.checkpoint_retry_delay.as_millis() as u64,
                        "Checkpoint write failed"
                    );
                    return Err(e.into());
                }
            }
            Command::Revive => {
                self.unhealthy_since = None;
                self.reviving = true;
            }
            Command::Close => {
                self.flush_pending().await;
            }
        }
        Ok(())
    }

    async fn after_transition(&mut self, command: Command, to: State) -> Option<Command> {
        match command {
            Command::Send(_) | Command::Revive if to == State::Sending => self.dispatch().await,
            Command::Ack(true) => self.pending_offset.map(Command::Checkpoint),
            Command::Checkpoint(_) => {
                self.current = None;
                self.pending_offset = None;
                None
            }
            _ => None,
        }
    }

    fn record_failure(&mut self, reason: String) {
        self.consecutive_failures += 1;
        if self.reviving {
            self.last_failed_revival_time = Some(Utc::now());
        }
        router_metrics::record_send_failure(self.endpoint.id());
        warn!(
            endpoint_id = %self.endpoint.id(),
            consecutive_failures = self.consecutive_failures,
            max_consecutive_failures = self.config.max_consecutive_failures,
            error = %reason,
            "Endpoint send failed"
        );
        self.last_error = Some(reason);
    }

    /// One delivery attempt of the current message
    async fn dispatch(&mut self) -> Option<Command> {
        let message = self.current.as_ref()?;
        let start = Instant::now();
        let outcome = self.endpoint.send(message).await;
        router_metrics::record_send_latency(self.endpoint.id(), start.elapsed());

        match outcome {
            SendOutcome::Delivered => Some(Command::Ack(true)),
            SendOutcome::Rejected { reason } => {
                // Retrying cannot succeed; move past the message so the endpoint is not blocked
                warn!(
                    endpoint_id = %self.endpoint.id(),
                    offset = message.offset(),
                    reason = %reason,
                    "Endpoint rejected message permanently, skipping"
                );
                router_metrics::record_rejected(self.endpoint.id());
                Some(Command::Ack(true))
            }
            SendOutcome::Failed { reason } => Some(Command::Fail(reason)),
        }
    }

    /// Best-effort write of an acknowledged but unpersisted offset
    async fn flush_pending(&mut self) {
        let Some(offset) = self.pending_offset else {
            return;
        };
        let data = self.checkpoint_data(offset);
        match self.checkpointer.commit(data).await {
            Ok(_) => {
                self.pending_offset = None;
                debug!(endpoint_id = %self.endpoint.id(), offset, "Flushed final checkpoint");
            }
            Err(e) => warn!(
                endpoint_id = %self.endpoint.id(),
                offset,
                error = %e,
                "Final checkpoint flush failed; message will be redelivered"
            ),
        }
    }

    fn checkpoint_data(&self, offset: i64) -> CheckpointData {
        CheckpointData::with_health(offset, self.last_failed_revival_time, self.unhealthy_since)
    }

    /// Persist health timestamps at the current durable offset
    async fn persist_health(&self) {
        let data = self.checkpoint_data(self.checkpointer.offset());
        if let Err(e) = self.checkpointer.commit(data).await {
            warn!(endpoint_id = %self.endpoint.id(), error = %e, "Failed to persist endpoint health");
        }
    }

    // ------------------------------------------------------------------------
    // State actions
    // ------------------------------------------------------------------------

    async fn enter(&mut self, state: State) {
        match state {
            State::Idle | State::Sending => {}
            State::CheckpointPending => {
                // delivered: any health record carried over from an earlier run is stale
                self.reviving = false;
                self.unhealthy_since = None;
                self.last_failed_revival_time = None;
            }
            State::Unhealthy => {
                self.reviving = false;
                let first = self.unhealthy_since.is_none();
                let since = *self.unhealthy_since.get_or_insert_with(Utc::now);
                if first {
                    warn!(endpoint_id = %self.endpoint.id(), unhealthy_since = %since, "Endpoint unhealthy");
                    self.emit(ExecutorEvent::Unhealthy {
                        endpoint_id: self.endpoint.id().to_string(),
                        consecutive_failures: self.consecutive_failures,
                    });
                }
                self.persist_health().await;
            }
            State::Dead => {
                self.reviving = false;
                self.unhealthy_since.get_or_insert_with(Utc::now);
                error!(
                    endpoint_id = %self.endpoint.id(),
                    consecutive_failures = self.consecutive_failures,
                    last_error = ?self.last_error,
                    "Endpoint dead; no further messages will be delivered"
                );
                router_metrics::record_dead(self.endpoint.id());
                self.persist_health().await;
                self.checkpointer.close();
                self.emit(ExecutorEvent::Dead {
                    endpoint_id: self.endpoint.id().to_string(),
                    consecutive_failures: self.consecutive_failures,
                    last_error: self.last_error.clone(),
                });
            }
            State::Closed => {
                self.checkpointer.close();
                info!(
                    endpoint_id = %self.endpoint.id(),
                    offset = self.checkpointer.offset(),
                    "Endpoint executor closed"
                );
            }
        }
    }

    /// Runs only when the state actually changes
    fn exit(&mut self, state: State) {
        if state == State::Unhealthy {
            self.last_failed_revival_time = None;
        }
    }

    fn record(&mut self, from: State, to: State, command: CommandKind) {
        debug!(endpoint_id = %self.endpoint.id(), ?from, ?to, ?command, "Transition");
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(TransitionRecord { from, to, command });

        if from == State::Unhealthy && matches!(to, State::Sending) {
            info!(endpoint_id = %self.endpoint.id(), "Reviving endpoint");
        }
        let revived = self
            .history
            .iter()
            .rev()
            .nth(1)
            .is_some_and(|r| r.from == State::Unhealthy);
        if from == State::Sending && to == State::CheckpointPending && revived {
            info!(endpoint_id = %self.endpoint.id(), "Endpoint recovered");
            self.emit(ExecutorEvent::Recovered {
                endpoint_id: self.endpoint.id().to_string(),
            });
        }
    }

    fn emit(&self, event: ExecutorEvent) {
        if let Some(events) = &self.events {
            // Receiver gone means the router is shutting down
            let _ = events.send(event);
        }
    }
}
