//! Error types shared by every chorus crate.

use std::time::Duration;

use crate::ids::{ConnectionId, DeliveryId};

/// Errors surfaced by a broker client.
///
/// `Unavailable` and `Timeout` are transient at steady state; everything
/// else describes a definite answer from the broker.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// Connection refused, reset or otherwise lost.
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    /// No reply within the deadline.
    #[error("broker operation timed out after {0:?}")]
    Timeout(Duration),
    /// Group creation raced another process.
    #[error("consumer group {group} already exists on {stream}")]
    GroupAlreadyExists { stream: String, group: String },
    /// The entry was not pending for this group.
    #[error("ack rejected for {id}: not pending")]
    AckRejected { id: DeliveryId },
    /// The stream or its consumer group is gone, as after a broker restart
    /// without persistence.
    #[error("consumer group missing: {0}")]
    NoGroup(String),
    /// Unexpected reply shape.
    #[error("broker protocol error: {0}")]
    Protocol(String),
    /// The caller gave up.
    #[error("cancelled")]
    Cancelled,
}

impl BrokerError {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "broker_unavailable",
            Self::Timeout(_) => "broker_timeout",
            Self::GroupAlreadyExists { .. } => "group_already_exists",
            Self::AckRejected { .. } => "delivery_ack_failure",
            Self::NoGroup(_) => "consumer_group_missing",
            Self::Protocol(_) => "broker_protocol",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Failure to hand an event to local connections.
#[derive(Clone, Debug, thiserror::Error)]
pub enum FanoutError {
    /// A single connection could not accept the frame. Isolated to that
    /// connection; the rest of the fan-out continues.
    #[error("write to {connection_id} failed: {reason}")]
    Connection {
        /// Target connection.
        connection_id: ConnectionId,
        /// What the connection reported.
        reason: String,
    },
    /// The event could not be rendered into a client frame.
    #[error("event could not be rendered: {0}")]
    Render(String),
    /// The registry no longer accepts deliveries (process is draining).
    #[error("connection registry is closed")]
    Closed,
}

/// Encoding or decoding failure at a wire boundary.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// A required field is absent.
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    /// A field is present but unparseable.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
    /// Malformed JSON.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
