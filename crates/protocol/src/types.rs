//! Core types shared across the protocol

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Block coordinates of a turtle in the world. Fractional coordinates are
/// rounded; anything non-numeric reads as 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    #[serde(default, deserialize_with = "lenient::coordinate")]
    pub x: i64,
    #[serde(default, deserialize_with = "lenient::coordinate")]
    pub y: i64,
    #[serde(default, deserialize_with = "lenient::coordinate")]
    pub z: i64,
}

/// A tracked turtle as held in the colony registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turtle {
    #[serde(deserialize_with = "turtle_id::required")]
    pub id: String,
    pub label: String,
    pub role: String,
    pub position: Position,
    /// As reported: a number, or `"unlimited"` when fuel is disabled
    pub fuel: Value,
    pub fuel_limit: Value,
    pub state: String,
    pub generation: Value,
    /// Unix millis of the last report
    pub last_seen: u64,
    /// Extra telemetry the agent reported (free slots, inventory, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A turtle record as reported by an agent. Every field is optional; the
/// colony fills in defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurtleReport {
    #[serde(
        default,
        deserialize_with = "turtle_id::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::position",
        skip_serializing_if = "Option::is_none"
    )]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fuel: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fuel_limit: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Birth announcement sent by a parent turtle after crafting a child
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BirthNotice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One entry of the colony event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColonyEvent {
    /// Unix millis
    pub time: u64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub message: String,
    #[serde(default = "empty_object")]
    pub data: Value,
}

/// Aggregate colony counters. Agents may report additional counters; those
/// are kept alongside the known ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColonyStats {
    #[serde(default)]
    pub total_blocks_mined: u64,
    #[serde(default)]
    pub total_turtles_born: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Full colony snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Colony {
    pub name: String,
    pub last_update: u64,
    pub turtles: BTreeMap<String, Turtle>,
    /// Newest first
    pub events: VecDeque<ColonyEvent>,
    pub stats: ColonyStats,
}

/// Command lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Sent,
    Completed,
    Failed,
}

impl CommandStatus {
    /// Completed and failed commands never change again
    pub fn is_finished(self) -> bool {
        matches!(self, CommandStatus::Completed | CommandStatus::Failed)
    }
}

/// An operator command queued for delivery to one turtle or to all of them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: u64,
    pub target_id: String,
    pub command: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Unix millis at enqueue time
    pub timestamp: u64,
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CommandResult>,
}

impl Command {
    pub fn is_broadcast(&self) -> bool {
        self.target_id == crate::BROADCAST_TARGET
    }
}

/// Outcome of a command as reported by the bridge. `commandId` and `message`
/// are kept as sent, along with unknown fields, so the broadcast carries the
/// report verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<Value>,
    #[serde(default, deserialize_with = "lenient::truthy")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CommandResult {
    /// The id this result refers to. Only an integer matches a command; a
    /// string such as `"7"` matches nothing.
    pub fn numeric_id(&self) -> Option<u64> {
        self.command_id.as_ref().and_then(Value::as_u64)
    }

    /// Message text for the event log, if any was sent
    pub fn message_text(&self) -> Option<String> {
        match self.message.as_ref()? {
            Value::Null => None,
            Value::String(s) if s.is_empty() => None,
            other => Some(display_value(other)),
        }
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Render a loosely typed JSON value for human-readable event messages.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Turtle ids come from the agent runtime as numbers (computer ids) or as
/// strings. Both are normalized to strings.
pub mod turtle_id {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    fn normalize<E: Error>(value: Value) -> Result<String, E> {
        match value {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(E::custom(format!(
                "expected a string or numeric id, got {other}"
            ))),
        }
    }

    pub fn required<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        normalize(Value::deserialize(deserializer)?)
    }

    pub fn optional<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<String>, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Null => Ok(None),
            value => normalize(value).map(Some),
        }
    }
}

/// Deserializers that never reject a report over a mistyped field.
mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    use super::Position;

    pub fn coordinate<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let number = match &value {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
            Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f.round() as i64),
            _ => None,
        };
        Ok(number.unwrap_or(0))
    }

    pub fn position<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Position>, D::Error> {
        match Value::deserialize(deserializer)? {
            value @ Value::Object(_) => Ok(serde_json::from_value(value).ok()),
            _ => Ok(None),
        }
    }

    /// JavaScript truthiness, which is how bridges have always reported success
    pub fn truthy<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::Null => false,
            Value::Bool(b) => b,
            Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) => true,
        })
    }
}
