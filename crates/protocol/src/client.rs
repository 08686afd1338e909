//! Client → Server messages
//!
//! Two kinds of clients talk to the server: the agent-side bridge posts
//! [`AgentUpdate`]s over HTTP, and observers send [`ClientMessage`]s over the
//! persistent channel.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{turtle_id, BirthNotice, TurtleReport};

/// Update envelope posted by the bridge to `/api/update`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentUpdate {
    Heartbeat(HeartbeatUpdate),
    Status(HeartbeatUpdate),
    Birth(BirthUpdate),
    #[serde(rename_all = "camelCase")]
    Event {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Stats {
        #[serde(default)]
        stats: Map<String, Value>,
    },
    #[serde(other)]
    Unknown,
}

/// Heartbeat/status body. Older bridges nest the record under `turtle`,
/// newer ones send it inline next to `type`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turtle: Option<TurtleReport>,
    #[serde(flatten)]
    pub inline: TurtleReport,
}

impl HeartbeatUpdate {
    pub fn into_report(self) -> TurtleReport {
        self.turtle.unwrap_or(self.inline)
    }
}

/// Birth body; the notice may sit under `data`, under `turtle`, or inline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BirthUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<BirthNotice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turtle: Option<BirthNotice>,
    #[serde(flatten)]
    pub inline: BirthNotice,
}

impl BirthUpdate {
    pub fn into_notice(self) -> BirthNotice {
        self.data.or(self.turtle).unwrap_or(self.inline)
    }
}

/// A command submitted by an operator, over HTTP or the channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    #[serde(deserialize_with = "turtle_id::required")]
    pub target_id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Map<String, Value>>,
}

/// Messages sent from observers over the persistent channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Command(CommandRequest),
    #[serde(other)]
    Unknown,
}
