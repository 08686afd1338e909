//! Live channel registry

use std::collections::HashMap;

use bytes::Bytes;
use colony_protocol::ServerMessage;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::frame::encode_message;

/// Process-local connection id, assigned at accept time
pub type ConnectionId = u64;

/// Outbound queue of encoded frames for one channel
pub type ChannelSender = mpsc::Sender<Bytes>;

/// Tracks every channel that completed the handshake
#[derive(Default)]
pub struct ConnectionRegistry {
    channels: HashMap<ConnectionId, ChannelSender>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.channels.contains_key(&id)
    }

    /// Register a channel and queue `init` on it before anything else.
    pub fn add(&mut self, id: ConnectionId, tx: ChannelSender, init: &ServerMessage) {
        match encode_message(init) {
            Ok(frame) => {
                if tx.try_send(frame).is_err() {
                    debug!(
                        component = "registry",
                        event = "registry.init.dropped",
                        connection_id = id,
                        "Could not queue init snapshot"
                    );
                }
            }
            Err(e) => {
                error!(
                    component = "registry",
                    event = "registry.init.serialize_failed",
                    connection_id = id,
                    error = %e,
                    "Failed to encode init snapshot"
                );
            }
        }

        self.channels.insert(id, tx);
        info!(
            component = "registry",
            event = "registry.channel.added",
            connection_id = id,
            total = self.channels.len(),
            "Channel registered"
        );
    }

    /// Remove a channel. Removing an unknown id is a no-op.
    pub fn remove(&mut self, id: ConnectionId) -> bool {
        let removed = self.channels.remove(&id).is_some();
        if removed {
            info!(
                component = "registry",
                event = "registry.channel.removed",
                connection_id = id,
                remaining = self.channels.len(),
                "Channel removed"
            );
        }
        removed
    }

    /// Send `msg` to every channel. A full or closed queue only affects that
    /// channel and does not unregister it. Returns how many channels accepted
    /// the frame.
    pub fn broadcast(&self, msg: &ServerMessage) -> usize {
        if self.channels.is_empty() {
            return 0;
        }

        let frame = match encode_message(msg) {
            Ok(frame) => frame,
            Err(e) => {
                error!(
                    component = "registry",
                    event = "registry.broadcast.serialize_failed",
                    error = %e,
                    "Failed to encode broadcast"
                );
                return 0;
            }
        };

        let mut delivered = 0;
        for (id, tx) in &self.channels {
            match tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(
                        component = "registry",
                        event = "registry.broadcast.send_failed",
                        connection_id = *id,
                        error = %e,
                        "Dropped broadcast for channel"
                    );
                }
            }
        }
        delivered
    }
}
