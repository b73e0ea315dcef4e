//! Relay counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counters updated by the relay engine.
#[derive(Debug, Default)]
pub struct RelayStats {
    published: AtomicU64,
    publish_failures: AtomicU64,
    fanned_out: AtomicU64,
    fanout_failures: AtomicU64,
    duplicates: AtomicU64,
    poisoned: AtomicU64,
    acked: AtomicU64,
    ack_failures: AtomicU64,
    relayed: AtomicU64,
    gaps: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Events published to the broker.
    pub published: u64,
    /// Publishes that gave up.
    pub publish_failures: u64,
    /// Frames handed to local connections.
    pub fanned_out: u64,
    /// Fan-outs that failed outright.
    pub fanout_failures: u64,
    /// Log entries skipped as already handled.
    pub duplicates: u64,
    /// Undecodable entries acked and dropped.
    pub poisoned: u64,
    /// Log entries acked.
    pub acked: u64,
    /// Acks the broker rejected or never received.
    pub ack_failures: u64,
    /// Shared-group entries re-broadcast on the event topic.
    pub relayed: u64,
    /// Pub/sub reconnects that may have lost messages.
    pub gaps: u64,
}

fn bump(counter: &AtomicU64) {
    let _ = counter.fetch_add(1, Ordering::Relaxed);
}

impl RelayStats {
    /// Count one successful publish.
    pub fn record_published(&self) {
        bump(&self.published);
    }

    /// Count a publish that gave up.
    pub fn record_publish_failure(&self) {
        bump(&self.publish_failures);
    }

    /// Count frames handed to local connections.
    pub fn record_fanned_out(&self, frames: usize) {
        let _ = self
            .fanned_out
            .fetch_add(u64::try_from(frames).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    /// Count a fan-out that failed outright.
    pub fn record_fanout_failure(&self) {
        bump(&self.fanout_failures);
    }

    /// Count a skipped redelivery.
    pub fn record_duplicate(&self) {
        bump(&self.duplicates);
    }

    /// Count an undecodable entry or message.
    pub fn record_poisoned(&self) {
        bump(&self.poisoned);
    }

    /// Count an acknowledged entry.
    pub fn record_acked(&self) {
        bump(&self.acked);
    }

    /// Count an ack that did not land.
    pub fn record_ack_failure(&self) {
        bump(&self.ack_failures);
    }

    /// Count a log entry handed to the event topic.
    pub fn record_relayed(&self) {
        bump(&self.relayed);
    }

    /// Count a pub/sub reconnect.
    pub fn record_gap(&self) {
        bump(&self.gaps);
    }

    /// Copy the current counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            fanned_out: self.fanned_out.load(Ordering::Relaxed),
            fanout_failures: self.fanout_failures.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            poisoned: self.poisoned.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            gaps: self.gaps.load(Ordering::Relaxed),
        }
    }
}
