//! Cluster events and their two broker encodings.
//!
//! Pub/sub carries an [`Event`] as one JSON document. The log carries it as a
//! flat field list (`id`, `message`, `timestamp`, `kind`, `room`) so entries
//! stay readable with plain broker tooling. `message` is stored verbatim, which
//! keeps replayed payloads byte-identical to what was published.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::errors::CodecError;
use crate::ids::{ConnectionId, DeliveryId, RoomId};

/// Field list of one log entry.
pub type Fields = BTreeMap<String, String>;

/// Origin connection id.
pub const FIELD_ID: &str = "id";
/// Message body.
pub const FIELD_MESSAGE: &str = "message";
/// Publish time in epoch milliseconds.
pub const FIELD_TIMESTAMP: &str = "timestamp";
/// Event kind; absent on entries from older producers.
pub const FIELD_KIND: &str = "kind";
/// Target room, absent for broadcasts.
pub const FIELD_ROOM: &str = "room";

/// What happened at the origin connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A chat message.
    Message,
    /// The origin connection attached.
    Connected,
    /// The origin connection went away.
    Disconnected,
}

impl EventKind {
    /// Wire name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "message" => Some(Self::Message),
            "connected" => Some(Self::Connected),
            "disconnected" => Some(Self::Disconnected),
            _ => None,
        }
    }
}

/// An event observed on one process and relayed to every other.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Connection the event came from.
    pub origin_id: ConnectionId,
    /// What happened.
    pub kind: EventKind,
    /// Opaque message body; empty for presence events.
    pub payload: String,
    /// Wall-clock milliseconds since the Unix epoch at publish time.
    pub timestamp: i64,
    /// Target room; `None` broadcasts to every connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomId>,
    /// Broker-assigned id; set on events read back from the log and on log
    /// entries re-broadcast over pub/sub.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<DeliveryId>,
}

impl Event {
    fn now(origin_id: ConnectionId, kind: EventKind, payload: String, room: Option<RoomId>) -> Self {
        Self {
            origin_id,
            kind,
            payload,
            timestamp: Utc::now().timestamp_millis(),
            room,
            delivery_id: None,
        }
    }

    /// A chat message stamped with the current time.
    pub fn message(origin_id: ConnectionId, payload: impl Into<String>, room: Option<RoomId>) -> Self {
        Self::now(origin_id, EventKind::Message, payload.into(), room)
    }

    /// Presence event for a new connection.
    pub fn connected(origin_id: ConnectionId) -> Self {
        Self::now(origin_id, EventKind::Connected, String::new(), None)
    }

    /// Presence event for a closed connection.
    pub fn disconnected(origin_id: ConnectionId) -> Self {
        Self::now(origin_id, EventKind::Disconnected, String::new(), None)
    }

    /// Encode for a pub/sub topic.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a pub/sub message.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Flat field list for a log append.
    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        let _ = fields.insert(FIELD_ID.into(), self.origin_id.to_string());
        let _ = fields.insert(FIELD_MESSAGE.into(), self.payload.clone());
        let _ = fields.insert(FIELD_TIMESTAMP.into(), self.timestamp.to_string());
        let _ = fields.insert(FIELD_KIND.into(), self.kind.as_str().into());
        if let Some(room) = &self.room {
            let _ = fields.insert(FIELD_ROOM.into(), room.to_string());
        }
        fields
    }

    /// Rebuild an event from a log entry.
    ///
    /// Entries written by older producers may lack `kind`; they are treated
    /// as chat messages.
    pub fn from_fields(delivery_id: DeliveryId, fields: &Fields) -> Result<Self, CodecError> {
        let origin = fields.get(FIELD_ID).ok_or(CodecError::MissingField(FIELD_ID))?;
        let payload = fields
            .get(FIELD_MESSAGE)
            .ok_or(CodecError::MissingField(FIELD_MESSAGE))?;
        let timestamp = fields
            .get(FIELD_TIMESTAMP)
            .ok_or(CodecError::MissingField(FIELD_TIMESTAMP))?
            .parse::<i64>()
            .map_err(|e| CodecError::InvalidField {
                field: FIELD_TIMESTAMP,
                reason: e.to_string(),
            })?;
        let kind = match fields.get(FIELD_KIND) {
            Some(k) => EventKind::parse(k).ok_or_else(|| CodecError::InvalidField {
                field: FIELD_KIND,
                reason: format!("unknown kind {k:?}"),
            })?,
            None => EventKind::Message,
        };
        Ok(Self {
            origin_id: ConnectionId::from_raw(origin.clone()),
            kind,
            payload: payload.clone(),
            timestamp,
            room: fields.get(FIELD_ROOM).map(|r| RoomId::from_raw(r.clone())),
            delivery_id: Some(delivery_id),
        })
    }
}

/// One entry read from a log stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    /// Broker-assigned entry id.
    pub id: DeliveryId,
    /// Raw field list as stored.
    pub fields: Fields,
}

impl LogRecord {
    /// Pair an entry id with its fields.
    pub fn new(id: DeliveryId, fields: Fields) -> Self {
        Self { id, fields }
    }

    /// Rebuild the relayed event from this entry.
    pub fn decode(&self) -> Result<Event, CodecError> {
        Event::from_fields(self.id.clone(), &self.fields)
    }
}
