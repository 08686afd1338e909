//! Dispatcher actor: sole owner of colony state, the command queue and the
//! channel registry.
//!
//! HTTP handlers and channel readers talk to it through `DispatcherHandle`,
//! which sends `DispatchCommand` messages over an mpsc channel. The staleness
//! sweep ticks inside the same loop, so every mutation is serialized.

use std::time::Duration;

use colony_protocol::{
    AgentUpdate, Colony, Command, CommandRequest, CommandResult, ServerMessage, Turtle,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::colony::{now_millis, ColonyError, ColonyState};
use crate::commands::{CommandQueue, ResultOutcome};
use crate::registry::{ChannelSender, ConnectionId, ConnectionRegistry};

const COMMAND_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub colony_name: String,
    pub stale_after: Duration,
    pub sweep_interval: Duration,
    pub command_lease: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatcher is not running")]
    Closed,

    #[error(transparent)]
    Colony(#[from] ColonyError),
}

/// A request for the dispatcher actor.
pub enum DispatchCommand {
    ApplyUpdate {
        update: AgentUpdate,
        reply: oneshot::Sender<Result<(), ColonyError>>,
    },
    Enqueue {
        request: CommandRequest,
        reply: oneshot::Sender<Command>,
    },
    PollPending {
        reply: oneshot::Sender<Vec<Command>>,
    },
    ReportResult {
        result: CommandResult,
        reply: oneshot::Sender<ResultOutcome>,
    },
    Snapshot {
        reply: oneshot::Sender<Colony>,
    },
    Turtles {
        reply: oneshot::Sender<Vec<Turtle>>,
    },
    /// Register a channel. The reply fires once `init` is queued on it.
    Connect {
        conn_id: ConnectionId,
        tx: ChannelSender,
        reply: oneshot::Sender<()>,
    },
    Disconnect {
        conn_id: ConnectionId,
    },
}

/// Handle to the running dispatcher (cheap to Clone).
#[derive(Clone)]
pub struct DispatcherHandle {
    command_tx: mpsc::Sender<DispatchCommand>,
}

impl DispatcherHandle {
    /// Spawn the dispatcher task and return a handle to it.
    pub fn spawn(settings: DispatchSettings) -> DispatcherHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let sweep_interval = settings.sweep_interval;
        let dispatcher = Dispatcher::new(settings, now_millis());

        tokio::spawn(actor_loop(dispatcher, command_rx, sweep_interval));

        DispatcherHandle { command_tx }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> DispatchCommand,
    ) -> Result<T, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(make(reply))
            .await
            .map_err(|_| DispatchError::Closed)?;
        rx.await.map_err(|_| DispatchError::Closed)
    }

    pub async fn apply_update(&self, update: AgentUpdate) -> Result<(), DispatchError> {
        self.request(|reply| DispatchCommand::ApplyUpdate { update, reply })
            .await??;
        Ok(())
    }

    pub async fn enqueue(&self, request: CommandRequest) -> Result<Command, DispatchError> {
        self.request(|reply| DispatchCommand::Enqueue { request, reply })
            .await
    }

    pub async fn poll_pending(&self) -> Result<Vec<Command>, DispatchError> {
        self.request(|reply| DispatchCommand::PollPending { reply })
            .await
    }

    pub async fn report_result(
        &self,
        result: CommandResult,
    ) -> Result<ResultOutcome, DispatchError> {
        self.request(|reply| DispatchCommand::ReportResult { result, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<Colony, DispatchError> {
        self.request(|reply| DispatchCommand::Snapshot { reply }).await
    }

    pub async fn turtles(&self) -> Result<Vec<Turtle>, DispatchError> {
        self.request(|reply| DispatchCommand::Turtles { reply }).await
    }

    /// Register a channel and wait until its `init` snapshot is queued.
    pub async fn connect(
        &self,
        conn_id: ConnectionId,
        tx: ChannelSender,
    ) -> Result<(), DispatchError> {
        self.request(|reply| DispatchCommand::Connect { conn_id, tx, reply })
            .await
    }

    pub async fn disconnect(&self, conn_id: ConnectionId) {
        if self
            .command_tx
            .send(DispatchCommand::Disconnect { conn_id })
            .await
            .is_err()
        {
            debug!(
                component = "dispatcher",
                event = "dispatcher.disconnect.dropped",
                connection_id = conn_id,
                "Dispatcher stopped before disconnect"
            );
        }
    }
}

async fn actor_loop(
    mut dispatcher: Dispatcher,
    mut command_rx: mpsc::Receiver<DispatchCommand>,
    sweep_interval: Duration,
) {
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    sweep.tick().await;

    info!(
        component = "dispatcher",
        event = "dispatcher.started",
        sweep_interval_secs = sweep_interval.as_secs(),
        "Dispatcher running"
    );

    loop {
        tokio::select! {
            cmd = command_rx.recv() => match cmd {
                Some(cmd) => dispatcher.handle(cmd, now_millis()),
                None => break,
            },
            _ = sweep.tick() => dispatcher.sweep(now_millis()),
        }
    }

    info!(
        component = "dispatcher",
        event = "dispatcher.stopped",
        "All handles dropped, dispatcher exiting"
    );
}

/// Synchronous core of the actor. Each operation mutates state and then
/// broadcasts the resulting messages in order.
struct Dispatcher {
    colony: ColonyState,
    commands: CommandQueue,
    registry: ConnectionRegistry,
    stale_after: Duration,
}

impl Dispatcher {
    fn new(settings: DispatchSettings, now: u64) -> Self {
        Self {
            colony: ColonyState::new(settings.colony_name, now),
            commands: CommandQueue::new(settings.command_lease),
            registry: ConnectionRegistry::new(),
            stale_after: settings.stale_after,
        }
    }

    fn handle(&mut self, cmd: DispatchCommand, now: u64) {
        match cmd {
            DispatchCommand::ApplyUpdate { update, reply } => {
                let _ = reply.send(self.apply_update(update, now));
            }
            DispatchCommand::Enqueue { request, reply } => {
                let _ = reply.send(self.enqueue(request, now));
            }
            DispatchCommand::PollPending { reply } => {
                let _ = reply.send(self.commands.poll_pending(now));
            }
            DispatchCommand::ReportResult { result, reply } => {
                let _ = reply.send(self.report_result(result, now));
            }
            DispatchCommand::Snapshot { reply } => {
                let _ = reply.send(self.colony.snapshot());
            }
            DispatchCommand::Turtles { reply } => {
                let _ = reply.send(self.colony.turtles().cloned().collect());
            }
            DispatchCommand::Connect { conn_id, tx, reply } => {
                self.connect(conn_id, tx);
                let _ = reply.send(());
            }
            DispatchCommand::Disconnect { conn_id } => {
                self.registry.remove(conn_id);
            }
        }
    }

    fn broadcast_all(&self, messages: Vec<ServerMessage>) {
        for msg in &messages {
            self.registry.broadcast(msg);
        }
    }

    fn apply_update(&mut self, update: AgentUpdate, now: u64) -> Result<(), ColonyError> {
        let messages = self.colony.apply_update(update, now)?;
        self.broadcast_all(messages);
        Ok(())
    }

    fn enqueue(&mut self, request: CommandRequest, now: u64) -> Command {
        let command = self.commands.enqueue(request, now);
        let target = if command.is_broadcast() {
            "all turtles".to_string()
        } else {
            format!("Turtle #{}", command.target_id)
        };

        let event = self.colony.add_event(
            "command",
            format!("Command sent: {} to {target}", command.command),
            serde_json::to_value(&command).ok(),
            now,
        );
        self.broadcast_all(vec![
            event,
            ServerMessage::CommandAck {
                data: command.clone(),
            },
        ]);
        debug!(
            component = "dispatcher",
            event = "dispatcher.command.queued",
            command_id = command.id,
            queued = self.commands.len(),
            "Command acknowledged"
        );
        command
    }

    fn report_result(&mut self, result: CommandResult, now: u64) -> ResultOutcome {
        let outcome = self.commands.report_result(&result);
        if let ResultOutcome::Unknown = outcome {
            warn!(
                component = "dispatcher",
                event = "dispatcher.result.unmatched",
                command_id = ?result.command_id,
                "Result does not match a known command"
            );
        }

        let verdict = if result.success { "completed" } else { "failed" };
        let message = match result.message_text() {
            Some(text) => format!("Command {verdict}: {text}"),
            None => format!("Command {verdict}"),
        };
        let data = serde_json::to_value(&result).unwrap_or(Value::Null);
        let event = self.colony.add_event("command_result", message, Some(data), now);

        self.broadcast_all(vec![event, ServerMessage::CommandResult { data: result }]);
        outcome
    }

    fn connect(&mut self, conn_id: ConnectionId, tx: ChannelSender) {
        if self.registry.contains(conn_id) {
            warn!(
                component = "dispatcher",
                event = "dispatcher.connect.duplicate",
                connection_id = conn_id,
                "Connection id already registered, replacing"
            );
        }
        let init = ServerMessage::Init {
            data: self.colony.snapshot(),
        };
        self.registry.add(conn_id, tx, &init);
    }

    fn sweep(&mut self, now: u64) {
        let messages = self.colony.sweep_stale(now, self.stale_after);
        if !messages.is_empty() {
            debug!(
                component = "dispatcher",
                event = "dispatcher.sweep.completed",
                messages = messages.len(),
                channels = self.registry.len(),
                "Staleness sweep broadcast"
            );
        }
        self.broadcast_all(messages);
    }
}
