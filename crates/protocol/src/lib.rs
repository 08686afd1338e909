//! Colony Protocol
//!
//! Shared types for communication between the colony relay server, the
//! agent-side bridge and observer clients. Everything here is serialized as
//! JSON, over HTTP for agent traffic and over the persistent channel for
//! observers.

pub mod client;
pub mod server;
pub mod types;

pub use client::{AgentUpdate, BirthUpdate, ClientMessage, CommandRequest, HeartbeatUpdate};
pub use server::{BirthPayload, ServerMessage};
pub use types::*;

/// Target id that addresses every turtle at once.
pub const BROADCAST_TARGET: &str = "all";
