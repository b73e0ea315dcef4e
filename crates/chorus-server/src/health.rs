//! `/liveness` and `/stats` endpoints.

use chorus_core::NodeId;
use chorus_relay::{RelayEngine, StatsSnapshot};
use serde::Serialize;

/// Liveness response body. Says nothing about broker health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LivenessResponse {
    /// Always `ok`.
    pub status: &'static str,
    /// Human-readable detail.
    pub message: &'static str,
}

/// Body for `/liveness`.
pub fn liveness() -> LivenessResponse {
    LivenessResponse {
        status: "ok",
        message: "The server is alive.",
    }
}

/// Operator view of one process.
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    /// This process.
    pub node: NodeId,
    /// Local connections.
    pub connections: usize,
    /// Rooms with at least one local or remote member.
    pub rooms: usize,
    /// Peers seen recently on the control topic.
    pub peers: Vec<NodeId>,
    /// Relay counters.
    pub relay: StatsSnapshot,
}

/// Collect the `/stats` body.
pub async fn stats(engine: &RelayEngine) -> StatsResponse {
    let mut peers = engine.membership().peers();
    peers.sort();
    StatsResponse {
        node: engine.config().node.clone(),
        connections: engine.registry().connection_count().await,
        rooms: engine.membership().rooms().await.len(),
        peers,
        relay: engine.stats(),
    }
}
