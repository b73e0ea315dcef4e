//! # chorus-broker
//!
//! The process-to-process medium. Two delivery shapes sit behind one trait:
//!
//! - **Topics**: fire-and-forget pub/sub. Every live subscriber receives a
//!   copy; nothing is retained for subscribers that are disconnected.
//! - **Logs**: append-only streams read through consumer groups. Entries
//!   stay pending against a consumer until acknowledged and can be claimed by
//!   another consumer once they sit idle too long.
//!
//! [`RedisBroker`] talks to Redis (`PUBLISH`/`SUBSCRIBE` and `XADD`/
//! `XREADGROUP`/`XACK`). [`MemoryBroker`] implements the same contract inside
//! one process for tests and single-node runs. [`GroupReader`] turns the log
//! primitives into the lazy batch sequence consumers iterate.

#![deny(unsafe_code)]

pub mod memory;
pub mod reader;
pub mod redis_broker;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chorus_core::{BrokerError, DeliveryId, Fields, LogRecord};
use chorus_settings::BrokerSettings;
use tokio::sync::mpsc;
use tracing::info;

pub use memory::MemoryBroker;
pub use reader::{GroupReader, GroupReaderConfig};
pub use redis_broker::RedisBroker;
pub use retry::{Backoff, RetryPolicy};

/// URL scheme selecting the in-process broker.
pub const MEMORY_SCHEME: &str = "memory://";

/// One item yielded by a [`Subscription`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriptionItem {
    /// A payload published on the topic.
    Message(Bytes),
    /// The subscription was lost and re-established. Anything published in
    /// between was not delivered.
    Resubscribed,
}

/// Live subscription to one topic. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<SubscriptionItem>,
}

impl Subscription {
    /// Wrap the receiving end a backend feeds.
    pub fn new(topic: impl Into<String>, rx: mpsc::UnboundedReceiver<SubscriptionItem>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    /// Topic this subscription listens on.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next item, or `None` once the broker has shut the subscription down.
    pub async fn next(&mut self) -> Option<SubscriptionItem> {
        self.rx.recv().await
    }
}

/// Outcome of [`Broker::ensure_group`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupStatus {
    /// The group did not exist and was created.
    Created,
    /// The group was already registered; nothing changed.
    AlreadyExists,
}

/// Where a group read starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadStart {
    /// Entries already delivered to this consumer and not yet acknowledged,
    /// strictly after `after` (from the beginning when `None`). Never blocks.
    Pending {
        /// Cursor: last entry already seen in this backlog walk.
        after: Option<DeliveryId>,
    },
    /// Entries never delivered to any consumer of the group. Blocks up to the
    /// request's `block` when none are available.
    New,
}

/// Parameters of one consumer-group read.
#[derive(Clone, Debug)]
pub struct GroupRead<'a> {
    /// Stream key.
    pub stream: &'a str,
    /// Consumer group name.
    pub group: &'a str,
    /// Consumer name within the group.
    pub consumer: &'a str,
    /// Backlog or new entries.
    pub start: ReadStart,
    /// Max entries returned.
    pub count: usize,
    /// How long a [`ReadStart::New`] read waits for entries.
    pub block: Duration,
}

/// Broker operations used by the relay.
///
/// Implementations must be safe to share as `Arc<dyn Broker>` across tasks.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Round trip to check the broker answers.
    async fn ping(&self) -> Result<(), BrokerError>;

    /// Publish to every current subscriber of `topic`.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Start receiving everything published on `topic` from now on.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError>;

    /// Append an entry, returning its broker-assigned id.
    async fn append(&self, stream: &str, fields: &Fields) -> Result<DeliveryId, BrokerError>;

    /// Create `group` on `stream` (creating the stream if needed), positioned
    /// at the current end. An existing group is left untouched.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<GroupStatus, BrokerError>;

    /// Recreate a group that vanished with its stream, positioned at the
    /// start so entries appended since are still delivered. An existing
    /// group is left untouched.
    async fn restore_group(&self, stream: &str, group: &str) -> Result<GroupStatus, BrokerError>;

    /// Read a batch for one consumer. An empty batch means the block timeout
    /// elapsed (or nothing is pending).
    async fn read_group(&self, read: &GroupRead<'_>) -> Result<Vec<LogRecord>, BrokerError>;

    /// Move entries idle for at least `min_idle` to `consumer` and return them.
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<LogRecord>, BrokerError>;

    /// Acknowledge an entry. Fails with [`BrokerError::AckRejected`] when it is
    /// not pending in the group.
    async fn ack(&self, stream: &str, group: &str, id: &DeliveryId) -> Result<(), BrokerError>;

    /// Stop background subscription tasks and release connections.
    async fn shutdown(&self);
}

/// Connect to the broker named by `settings.url`.
pub async fn connect(settings: &BrokerSettings) -> Result<Arc<dyn Broker>, BrokerError> {
    if settings.url.starts_with(MEMORY_SCHEME) {
        info!("using in-process memory broker");
        return Ok(Arc::new(MemoryBroker::new()));
    }
    let broker = RedisBroker::connect(settings).await?;
    Ok(Arc::new(broker))
}
