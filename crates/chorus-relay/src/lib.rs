//! # chorus-relay
//!
//! Process-local state and the relay between local connections and the
//! broker.
//!
//! - [`ConnectionRegistry`]: attached connections and their rooms; the
//!   [`LocalDelivery`] fan-out target
//! - [`RelayEngine`]: publishes local occurrences upstream, fans broker events
//!   out locally, acknowledges log entries after fan-out
//! - [`MembershipReplicator`]: replicates room joins and leaves on the
//!   control topic and tracks what peers have announced
//! - [`DedupWindow`] and [`RelayStats`]: duplicate suppression and counters

#![deny(unsafe_code)]

pub mod dedup;
pub mod engine;
pub mod membership;
pub mod registry;
pub mod stats;

pub use dedup::DedupWindow;
pub use engine::{Inbound, RecordOutcome, RelayConfig, RelayEngine};
pub use membership::{ControlOutcome, MembershipConfig, MembershipReplicator, RoomCounts};
pub use registry::{
    Connection, ConnectionRegistry, FanoutReport, JoinOutcome, LeaveOutcome, LocalDelivery, Outbound, Scope,
};
pub use stats::{RelayStats, StatsSnapshot};
