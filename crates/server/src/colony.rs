//! Authoritative colony model: turtle registry, event log, stats.
//!
//! Every mutation returns the messages that describe it, in the order they
//! must be broadcast. The caller owns delivery.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use colony_protocol::{
    display_value, AgentUpdate, BirthNotice, BirthPayload, Colony, ColonyEvent, ColonyStats,
    Position, ServerMessage, Turtle, TurtleReport,
};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Maximum number of events kept in the log
pub const EVENT_CAPACITY: usize = 100;

pub const DEFAULT_FUEL_LIMIT: i64 = 20_000;
pub const DEFAULT_STATE: &str = "idle";
pub const DEFAULT_ROLE: &str = "worker";
pub const OFFLINE_STATE: &str = "offline";

/// Fields of a turtle record owned by the server, never taken from reports
const RESERVED_TURTLE_FIELDS: &[&str] = &["lastSeen"];

#[derive(Debug, Error)]
pub enum ColonyError {
    #[error("turtle report has no id")]
    MissingTurtleId,

    #[error("invalid stats update: {0}")]
    InvalidStats(#[source] serde_json::Error),
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub struct ColonyState {
    name: String,
    last_update: u64,
    turtles: BTreeMap<String, Turtle>,
    events: VecDeque<ColonyEvent>,
    stats: ColonyStats,
}

impl ColonyState {
    pub fn new(name: impl Into<String>, now: u64) -> Self {
        Self {
            name: name.into(),
            last_update: now,
            turtles: BTreeMap::new(),
            events: VecDeque::with_capacity(EVENT_CAPACITY),
            stats: ColonyStats::default(),
        }
    }

    /// Full snapshot, as sent in `init` and served by `/api/status`
    pub fn snapshot(&self) -> Colony {
        Colony {
            name: self.name.clone(),
            last_update: self.last_update,
            turtles: self.turtles.clone(),
            events: self.events.clone(),
            stats: self.stats.clone(),
        }
    }

    #[allow(dead_code)]
    pub fn turtle(&self, id: &str) -> Option<&Turtle> {
        self.turtles.get(id)
    }

    pub fn turtles(&self) -> impl Iterator<Item = &Turtle> {
        self.turtles.values()
    }

    #[allow(dead_code)]
    pub fn events(&self) -> &VecDeque<ColonyEvent> {
        &self.events
    }

    #[allow(dead_code)]
    pub fn stats(&self) -> &ColonyStats {
        &self.stats
    }

    /// Apply an update posted by the bridge.
    ///
    /// Validation happens before anything is touched, so an error leaves the
    /// colony unchanged.
    pub fn apply_update(
        &mut self,
        update: AgentUpdate,
        now: u64,
    ) -> Result<Vec<ServerMessage>, ColonyError> {
        let messages = match update {
            AgentUpdate::Heartbeat(body) | AgentUpdate::Status(body) => {
                let report = body.into_report();
                let id = report.id.clone().ok_or(ColonyError::MissingTurtleId)?;
                self.last_update = now;
                self.upsert_turtle(id, report, now)
            }
            AgentUpdate::Birth(body) => {
                self.last_update = now;
                self.record_birth(body.into_notice(), now)
            }
            AgentUpdate::Event {
                event_type,
                message,
                data,
            } => {
                self.last_update = now;
                vec![self.add_event(
                    event_type.unwrap_or_else(|| "info".to_string()),
                    message.unwrap_or_default(),
                    data,
                    now,
                )]
            }
            AgentUpdate::Stats { stats } => {
                let merged = merge_stats(&self.stats, stats)?;
                self.last_update = now;
                self.stats = merged;
                vec![ServerMessage::Stats {
                    data: self.stats.clone(),
                }]
            }
            AgentUpdate::Unknown => {
                self.last_update = now;
                debug!(
                    component = "colony",
                    event = "colony.update.unknown_type",
                    "Ignoring update with unrecognized type"
                );
                Vec::new()
            }
        };
        Ok(messages)
    }

    /// Insert at the front of the log, dropping the oldest past capacity.
    pub fn add_event(
        &mut self,
        kind: impl Into<String>,
        message: impl Into<String>,
        data: Option<Value>,
        now: u64,
    ) -> ServerMessage {
        let event = ColonyEvent {
            time: now,
            kind: kind.into(),
            message: message.into(),
            data: data.unwrap_or_else(|| Value::Object(Map::new())),
        };
        info!(
            component = "colony",
            event = "colony.event.added",
            event_type = %event.kind,
            message = %event.message,
            "Colony event"
        );

        self.events.push_front(event.clone());
        self.events.truncate(EVENT_CAPACITY);
        ServerMessage::Event { data: event }
    }

    /// Mark turtles silent for longer than `stale_after` as offline.
    pub fn sweep_stale(&mut self, now: u64, stale_after: Duration) -> Vec<ServerMessage> {
        let threshold = stale_after.as_millis() as u64;
        let stale: Vec<String> = self
            .turtles
            .values()
            .filter(|t| t.state != OFFLINE_STATE && now.saturating_sub(t.last_seen) > threshold)
            .map(|t| t.id.clone())
            .collect();

        let mut messages = Vec::new();
        for id in stale {
            let Some(turtle) = self.turtles.get_mut(&id) else {
                continue;
            };
            turtle.state = OFFLINE_STATE.to_string();
            let turtle = turtle.clone();
            warn!(
                component = "colony",
                event = "colony.turtle.offline",
                turtle_id = %id,
                silent_ms = now.saturating_sub(turtle.last_seen),
                "Turtle marked offline"
            );

            messages.push(self.add_event(
                "offline",
                format!("{} went offline", turtle.label),
                Some(serde_json::json!({ "id": id })),
                now,
            ));
            messages.push(ServerMessage::Heartbeat { turtle });
        }
        messages
    }

    fn upsert_turtle(&mut self, id: String, report: TurtleReport, now: u64) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        let reported_label = report.label.clone().filter(|l| !l.is_empty());

        let turtle = match self.turtles.get_mut(&id) {
            Some(existing) => {
                apply_report(existing, report, now);
                existing.clone()
            }
            None => {
                let mut turtle = Turtle {
                    id: id.clone(),
                    label: String::new(),
                    role: String::new(),
                    position: Position::default(),
                    fuel: Value::from(0),
                    fuel_limit: Value::from(DEFAULT_FUEL_LIMIT),
                    state: String::new(),
                    generation: Value::from(0),
                    last_seen: now,
                    extra: Map::new(),
                };
                apply_report(&mut turtle, report, now);
                self.turtles.insert(id.clone(), turtle.clone());

                self.stats.total_turtles_born += 1;
                info!(
                    component = "colony",
                    event = "colony.turtle.birth",
                    turtle_id = %id,
                    total_born = self.stats.total_turtles_born,
                    "New turtle joined the colony"
                );
                let who = reported_label.unwrap_or_else(|| id.clone());
                messages.push(self.add_event(
                    "birth",
                    format!("{who} joined the colony"),
                    None,
                    now,
                ));
                messages.push(ServerMessage::Birth {
                    turtle: BirthPayload::Turtle(turtle.clone()),
                });
                turtle
            }
        };

        messages.push(ServerMessage::Heartbeat { turtle });
        messages
    }

    fn record_birth(&mut self, notice: BirthNotice, now: u64) -> Vec<ServerMessage> {
        let child = notice
            .child
            .as_ref()
            .map(display_value)
            .unwrap_or_else(|| "New turtle".to_string());
        let parent = notice
            .parent
            .as_ref()
            .map(display_value)
            .unwrap_or_else(|| "unknown".to_string());
        let generation = notice
            .generation
            .as_ref()
            .map(display_value)
            .unwrap_or_else(|| "?".to_string());

        self.stats.total_turtles_born += 1;
        info!(
            component = "colony",
            event = "colony.birth.announced",
            child = %child,
            parent = %parent,
            generation = %generation,
            "Birth announced by parent"
        );

        let event = self.add_event(
            "birth",
            format!("{child} born! Parent: {parent}, Gen {generation}"),
            None,
            now,
        );
        vec![
            event,
            ServerMessage::Birth {
                turtle: BirthPayload::Notice(notice),
            },
        ]
    }
}

/// Overwrite a turtle's mutable fields from a full report. Absent fields fall
/// back to their defaults, matching what a fresh report describes.
fn apply_report(turtle: &mut Turtle, report: TurtleReport, now: u64) {
    turtle.label = report
        .label
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| format!("Turtle-{}", turtle.id));
    turtle.role = report.role.unwrap_or_else(|| DEFAULT_ROLE.to_string());
    turtle.position = report.position.unwrap_or_default();
    turtle.fuel = report.fuel.unwrap_or_else(|| Value::from(0));
    turtle.fuel_limit = report
        .fuel_limit
        .unwrap_or_else(|| Value::from(DEFAULT_FUEL_LIMIT));
    turtle.state = report.state.unwrap_or_else(|| DEFAULT_STATE.to_string());
    turtle.generation = report.generation.unwrap_or_else(|| Value::from(0));
    turtle.last_seen = now;

    let mut extra = report.extra;
    for field in RESERVED_TURTLE_FIELDS {
        extra.remove(*field);
    }
    turtle.extra = extra;
}

/// Field-by-field merge; fields missing from `update` keep their value.
fn merge_stats(current: &ColonyStats, update: Map<String, Value>) -> Result<ColonyStats, ColonyError> {
    let mut merged = match serde_json::to_value(current).map_err(ColonyError::InvalidStats)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    merged.extend(update);
    serde_json::from_value(Value::Object(merged)).map_err(ColonyError::InvalidStats)
}
