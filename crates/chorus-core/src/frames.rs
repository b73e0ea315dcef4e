//! JSON text frames exchanged with WebSocket clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::CodecError;
use crate::event::{Event, EventKind};
use crate::ids::{ConnectionId, RoomId};

/// Frames a client may send.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Relay `body` to other clients.
    Message {
        /// Arbitrary JSON payload.
        body: Value,
        /// Room to deliver into; broadcast when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<RoomId>,
    },
    /// Join a room.
    Join {
        /// Target room.
        room: RoomId,
    },
    /// Leave a room.
    Leave {
        /// Target room.
        room: RoomId,
    },
}

impl ClientFrame {
    /// Parse one text frame.
    pub fn parse(text: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Presence transition reported to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    /// Connected.
    Connected,
    /// Disconnected.
    Disconnected,
}

/// Frames the server sends to clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// First frame on a new connection.
    Welcome {
        /// Id assigned to this client.
        id: ConnectionId,
    },
    /// A message relayed from another client.
    Message {
        /// Sender connection.
        from: ConnectionId,
        /// Payload as sent, or the raw text if it was not JSON.
        body: Value,
        /// Room it was sent to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<RoomId>,
        /// Publish time in epoch milliseconds.
        timestamp: i64,
    },
    /// Another client connected or disconnected.
    Presence {
        /// Connection the change concerns.
        id: ConnectionId,
        /// Whether it connected or disconnected.
        status: PresenceStatus,
    },
    /// Pub/sub messages may have been lost while the process was cut off
    /// from the broker.
    Gap,
    /// The last client frame was rejected.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

impl ServerFrame {
    /// Client-facing view of a relayed event.
    ///
    /// Payloads that are not JSON are passed through as a JSON string.
    pub fn from_event(event: &Event) -> Self {
        match event.kind {
            EventKind::Message => {
                let body = serde_json::from_str(&event.payload)
                    .unwrap_or_else(|_| Value::String(event.payload.clone()));
                Self::Message {
                    from: event.origin_id.clone(),
                    body,
                    room: event.room.clone(),
                    timestamp: event.timestamp,
                }
            }
            EventKind::Connected => Self::Presence {
                id: event.origin_id.clone(),
                status: PresenceStatus::Connected,
            },
            EventKind::Disconnected => Self::Presence {
                id: event.origin_id.clone(),
                status: PresenceStatus::Disconnected,
            },
        }
    }

    /// Serialize for a text frame.
    pub fn to_json(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }
}
