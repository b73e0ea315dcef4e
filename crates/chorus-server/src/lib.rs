//! # chorus-server
//!
//! The process shell around the relay.
//!
//! - `GET /ws`: WebSocket sessions feeding the relay dispatcher
//! - `GET /liveness` and `GET /stats`
//! - [`Lifecycle`]: startup sequencing, single drain on termination, signals
//! - Telemetry setup and supervisor readiness notification

#![deny(unsafe_code)]

pub mod health;
pub mod lifecycle;
#[cfg(unix)]
pub mod notify;
pub mod server;
pub mod shutdown;
pub mod telemetry;
pub mod transport;

pub use lifecycle::{DrainOutcome, Lifecycle, LifecycleError, LifecycleState};
pub use server::{router, AppState};
pub use shutdown::ShutdownCoordinator;
pub use telemetry::init_telemetry;
pub use transport::TransportConfig;
