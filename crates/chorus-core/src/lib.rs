//! # chorus-core
//!
//! Types shared by every chorus crate:
//!
//! - [`ids`]: connection, room, node and log delivery identifiers
//! - [`event`]: the relayed [`Event`] and its pub/sub and log encodings
//! - [`frames`]: JSON frames exchanged with WebSocket clients
//! - [`control`]: control-plane messages between server processes
//! - [`errors`]: broker, fan-out and codec error taxonomy

#![deny(unsafe_code)]

pub mod control;
pub mod errors;
pub mod event;
pub mod frames;
pub mod ids;

pub use control::{ControlMessage, MembershipAction, MembershipNotice};
pub use errors::{BrokerError, CodecError, FanoutError};
pub use event::{Event, EventKind, Fields, LogRecord};
pub use frames::{ClientFrame, PresenceStatus, ServerFrame};
pub use ids::{ConnectionId, DeliveryId, NodeId, RoomId};
