//! Control-plane messages exchanged between server processes.
//!
//! These travel on their own topic, separate from relayed chat events.

use serde::{Deserialize, Serialize};

use crate::errors::CodecError;
use crate::ids::{ConnectionId, NodeId, RoomId};

/// Direction of a room transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipAction {
    /// Entered the room.
    Join,
    /// Left the room.
    Leave,
}

/// A local room transition announced to peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipNotice {
    /// Room that was joined or left.
    pub room: RoomId,
    /// The connection that joined or left.
    pub id: ConnectionId,
    /// Join or leave.
    pub action: MembershipAction,
    /// Process that owns the connection.
    pub node: NodeId,
}

/// Message carried on the control topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// A local join or leave.
    Membership(MembershipNotice),
    /// Periodic liveness beacon.
    Heartbeat { node: NodeId },
    /// Sent once by a draining process.
    Leaving { node: NodeId },
}

impl ControlMessage {
    /// Process that sent this message.
    pub fn node(&self) -> &NodeId {
        match self {
            Self::Membership(notice) => &notice.node,
            Self::Heartbeat { node } | Self::Leaving { node } => node,
        }
    }

    /// Encode for the control topic.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a control topic message.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
