//! Server → Client messages

use serde::{Deserialize, Serialize};

use crate::types::*;

/// Messages broadcast from the server to every connected channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // Full state sync, always the first message on a new channel
    Init { data: Colony },

    // Incremental updates
    Heartbeat { turtle: Turtle },
    Birth { turtle: BirthPayload },
    Event { data: ColonyEvent },
    Stats { data: ColonyStats },

    // Command lifecycle
    CommandAck { data: Command },
    CommandResult { data: CommandResult },
}

/// A birth is announced either with the freshly registered turtle (first
/// heartbeat from an unknown id) or with the parent's raw notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BirthPayload {
    Turtle(Turtle),
    Notice(BirthNotice),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    #[test]
    fn command_ack_uses_snake_case_tag_and_data_field() {
        let msg = ServerMessage::CommandAck {
            data: Command {
                id: 4,
                target_id: "all".into(),
                command: "stop".into(),
                args: Map::new(),
                timestamp: 10,
                status: CommandStatus::Pending,
                result: None,
            },
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "command_ack");
        assert_eq!(value["data"]["id"], 4);
        assert_eq!(value["data"]["targetId"], "all");
    }

    #[test]
    fn birth_payload_distinguishes_turtles_from_notices() {
        let notice: ServerMessage = serde_json::from_value(json!({
            "type": "birth",
            "turtle": {"parent": 1, "child": 2, "generation": 1}
        }))
        .unwrap();
        assert!(matches!(
            notice,
            ServerMessage::Birth {
                turtle: BirthPayload::Notice(_)
            }
        ));

        let turtle: ServerMessage = serde_json::from_value(json!({
            "type": "birth",
            "turtle": {
                "id": "t1", "label": "Bob", "role": "worker",
                "position": {"x": 0, "y": 0, "z": 0},
                "fuel": 0, "fuelLimit": 20000, "state": "idle",
                "generation": 0, "lastSeen": 5
            }
        }))
        .unwrap();
        match turtle {
            ServerMessage::Birth {
                turtle: BirthPayload::Turtle(t),
            } => assert_eq!(t.label, "Bob"),
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
