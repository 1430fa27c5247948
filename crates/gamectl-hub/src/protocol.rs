//! Wire messages between the hub and its WebSocket clients.
//!
//! Client frames are JSON text with a `type` tag; everything the hub sends
//! back shares that shape. Broadcast traffic reuses the control plane's
//! [`Event`] serialization verbatim, so a client routes on `type` alone.

use gamectl_core::{Event, InstanceStatus, StatusReply};
use serde::{Deserialize, Serialize};

/// Inbound frame from a connected client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving events scoped to this instance.
    Subscribe { instance_id: String },
    /// Stop receiving events scoped to this instance.
    Unsubscribe { instance_id: String },
    /// Forward a console command to the instance.
    SendCommand { instance_id: String, command: String },
    /// Ask for the instance's current status; answered on this client's
    /// own queue only.
    GetStatus { instance_id: String },
}

/// Direct reply to a single client, as opposed to broadcast traffic.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Status {
        instance_id: String,
        status: InstanceStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    Error {
        error: String,
    },
}

impl From<StatusReply> for Reply {
    fn from(reply: StatusReply) -> Self {
        Self::Status {
            instance_id: reply.instance_id,
            status: reply.status,
            pid: reply.pid,
        }
    }
}

/// One message travelling down a client's outbound queue.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Bus traffic relayed to every matching client.
    Event(Event),
    /// Reply addressed to this client alone.
    Reply(Reply),
}

impl Outbound {
    /// Serialize to the JSON text carried in a WebSocket frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Event(event) => serde_json::to_string(event),
            Self::Reply(reply) => serde_json::to_string(reply),
        }
    }
}
