//! Operator command queue.
//!
//! Commands move forward only: `pending -> sent -> completed | failed`. With a
//! lease configured, a `sent` command that never got a result goes back to
//! `pending` and is redelivered on the next poll.

use std::collections::BTreeMap;
use std::time::Duration;

use colony_protocol::{Command, CommandRequest, CommandResult, CommandStatus};
use tracing::{debug, info};

/// Finished commands kept for inspection before the oldest are dropped
pub const FINISHED_RETENTION: usize = 1000;

struct QueuedCommand {
    record: Command,
    /// Unix millis of the last poll that delivered this command
    leased_at: Option<u64>,
}

/// What a reported result did to the queue
#[derive(Debug, Clone, PartialEq)]
pub enum ResultOutcome {
    /// The command moved to its final status
    Applied(Command),
    /// The command had already finished and was left untouched
    AlreadyFinished(Command),
    /// No command with that id is known
    Unknown,
}

pub struct CommandQueue {
    next_id: u64,
    lease: Option<Duration>,
    commands: BTreeMap<u64, QueuedCommand>,
    finished: usize,
}

impl CommandQueue {
    pub fn new(lease: Option<Duration>) -> Self {
        Self {
            next_id: 1,
            lease,
            commands: BTreeMap::new(),
            finished: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[allow(dead_code)]
    pub fn get(&self, id: u64) -> Option<&Command> {
        self.commands.get(&id).map(|queued| &queued.record)
    }

    pub fn enqueue(&mut self, request: CommandRequest, now: u64) -> Command {
        let id = self.next_id;
        self.next_id += 1;

        let record = Command {
            id,
            target_id: request.target_id,
            command: request.command,
            args: request.args.unwrap_or_default(),
            timestamp: now,
            status: CommandStatus::Pending,
            result: None,
        };
        info!(
            component = "commands",
            event = "commands.enqueued",
            command_id = id,
            target_id = %record.target_id,
            command = %record.command,
            "Command queued"
        );

        self.commands.insert(
            id,
            QueuedCommand {
                record: record.clone(),
                leased_at: None,
            },
        );
        record
    }

    /// Hand out every pending command, in id order, and mark them `sent`.
    pub fn poll_pending(&mut self, now: u64) -> Vec<Command> {
        self.requeue_expired(now);

        let mut batch = Vec::new();
        for queued in self.commands.values_mut() {
            if queued.record.status != CommandStatus::Pending {
                continue;
            }
            queued.record.status = CommandStatus::Sent;
            queued.leased_at = Some(now);
            batch.push(queued.record.clone());
        }

        if !batch.is_empty() {
            info!(
                component = "commands",
                event = "commands.delivered",
                count = batch.len(),
                "Pending commands handed to bridge"
            );
        }
        batch
    }

    pub fn report_result(&mut self, result: &CommandResult) -> ResultOutcome {
        let Some(id) = result.numeric_id() else {
            debug!(
                component = "commands",
                event = "commands.result.unmatched_id",
                command_id = ?result.command_id,
                "Result id is not a command id"
            );
            return ResultOutcome::Unknown;
        };
        let Some(queued) = self.commands.get_mut(&id) else {
            debug!(
                component = "commands",
                event = "commands.result.unknown",
                command_id = id,
                "Result for unknown command"
            );
            return ResultOutcome::Unknown;
        };

        if queued.record.status.is_finished() {
            debug!(
                component = "commands",
                event = "commands.result.duplicate",
                command_id = id,
                "Result for already finished command"
            );
            return ResultOutcome::AlreadyFinished(queued.record.clone());
        }

        queued.record.status = if result.success {
            CommandStatus::Completed
        } else {
            CommandStatus::Failed
        };
        queued.record.result = Some(result.clone());
        queued.leased_at = None;
        let record = queued.record.clone();

        self.finished += 1;
        self.prune_finished();
        ResultOutcome::Applied(record)
    }

    fn requeue_expired(&mut self, now: u64) {
        let Some(lease) = self.lease else {
            return;
        };
        let lease_ms = lease.as_millis() as u64;

        for queued in self.commands.values_mut() {
            let expired = queued.record.status == CommandStatus::Sent
                && queued
                    .leased_at
                    .is_some_and(|at| now.saturating_sub(at) >= lease_ms);
            if expired {
                queued.record.status = CommandStatus::Pending;
                queued.leased_at = None;
                info!(
                    component = "commands",
                    event = "commands.lease.expired",
                    command_id = queued.record.id,
                    "Command lease expired, requeued"
                );
            }
        }
    }

    fn prune_finished(&mut self) {
        if self.finished <= FINISHED_RETENTION {
            return;
        }
        let excess = self.finished - FINISHED_RETENTION;
        let oldest: Vec<u64> = self
            .commands
            .iter()
            .filter(|(_, queued)| queued.record.status.is_finished())
            .take(excess)
            .map(|(id, _)| *id)
            .collect();
        for id in oldest {
            self.commands.remove(&id);
        }
        self.finished = FINISHED_RETENTION;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(target: &str, command: &str) -> CommandRequest {
        CommandRequest {
            target_id: target.to_string(),
            command: command.to_string(),
            args: None,
        }
    }

    fn result(id: u64, success: bool) -> CommandResult {
        CommandResult {
            command_id: Some(json!(id)),
            success,
            message: Some(json!("ok")),
            ..Default::default()
        }
    }

    #[test]
    fn ids_are_monotonic_from_one() {
        let mut queue = CommandQueue::new(None);
        let first = queue.enqueue(request("all", "refuel"), 10);
        let second = queue.enqueue(request("5", "mine"), 11);
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(first.status, CommandStatus::Pending);
        assert_eq!(first.timestamp, 10);
        assert!(first.args.is_empty());
    }

    #[test]
    fn args_are_kept_verbatim() {
        let mut queue = CommandQueue::new(None);
        let args = json!({"depth": 12, "pattern": "strip"});
        let cmd = queue.enqueue(
            CommandRequest {
                target_id: "3".into(),
                command: "mine".into(),
                args: args.as_object().cloned(),
            },
            0,
        );
        assert_eq!(serde_json::Value::Object(cmd.args), args);
    }

    #[test]
    fn poll_delivers_each_command_once_in_order() {
        let mut queue = CommandQueue::new(None);
        queue.enqueue(request("all", "a"), 0);
        queue.enqueue(request("all", "b"), 0);

        let batch = queue.poll_pending(1);
        let ids: Vec<u64> = batch.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(batch.iter().all(|c| c.status == CommandStatus::Sent));

        assert!(queue.poll_pending(2).is_empty());
        assert!(queue.poll_pending(1_000_000).is_empty());
    }

    #[test]
    fn lease_requeues_unanswered_commands() {
        let mut queue = CommandQueue::new(Some(Duration::from_secs(10)));
        queue.enqueue(request("7", "dig"), 0);
        queue.enqueue(request("7", "dig"), 0);

        assert_eq!(queue.poll_pending(1_000).len(), 2);
        queue.report_result(&result(1, true));

        assert!(queue.poll_pending(5_000).is_empty());
        let redelivered = queue.poll_pending(11_000);
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].id, 2);
    }

    #[test]
    fn result_finishes_command() {
        let mut queue = CommandQueue::new(None);
        queue.enqueue(request("all", "a"), 0);
        queue.enqueue(request("all", "b"), 0);
        queue.poll_pending(1);

        let ResultOutcome::Applied(done) = queue.report_result(&result(1, true)) else {
            panic!("expected applied result");
        };
        assert_eq!(done.status, CommandStatus::Completed);
        assert_eq!(
            done.result.as_ref().and_then(CommandResult::message_text).as_deref(),
            Some("ok")
        );

        let ResultOutcome::Applied(failed) = queue.report_result(&result(2, false)) else {
            panic!("expected applied result");
        };
        assert_eq!(failed.status, CommandStatus::Failed);
    }

    #[test]
    fn finished_status_never_changes() {
        let mut queue = CommandQueue::new(None);
        queue.enqueue(request("all", "a"), 0);
        queue.report_result(&result(1, false));

        let outcome = queue.report_result(&result(1, true));
        assert!(matches!(
            outcome,
            ResultOutcome::AlreadyFinished(ref cmd) if cmd.status == CommandStatus::Failed
        ));
        assert_eq!(queue.get(1).map(|c| c.status), Some(CommandStatus::Failed));
    }

    #[test]
    fn unknown_result_id_touches_nothing() {
        let mut queue = CommandQueue::new(None);
        queue.enqueue(request("all", "a"), 0);

        assert_eq!(queue.report_result(&result(42, true)), ResultOutcome::Unknown);
        assert_eq!(
            queue.report_result(&CommandResult::default()),
            ResultOutcome::Unknown
        );
        let string_id = CommandResult {
            command_id: Some(json!("1")),
            ..result(1, true)
        };
        assert_eq!(queue.report_result(&string_id), ResultOutcome::Unknown);
        assert_eq!(queue.get(1).map(|c| c.status), Some(CommandStatus::Pending));
    }

    #[test]
    fn oldest_finished_commands_are_pruned() {
        let mut queue = CommandQueue::new(None);
        let open = queue.enqueue(request("all", "keep"), 0);
        for _ in 0..FINISHED_RETENTION + 5 {
            let cmd = queue.enqueue(request("all", "x"), 0);
            queue.report_result(&result(cmd.id, true));
        }

        assert_eq!(queue.len(), FINISHED_RETENTION + 1);
        assert!(queue.get(open.id).is_some());
        assert!(queue.get(2).is_none());
        assert!(queue.get(6).is_none());
        assert!(queue.get(7).is_some());
    }
}
