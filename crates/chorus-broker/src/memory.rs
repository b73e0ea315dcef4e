//! In-process broker with the same delivery contract as Redis.
//!
//! Clones share state, so several relay engines in one test (or one process
//! started with `memory://`) see the same topics and logs. Availability can be
//! switched off to exercise outage handling: while unavailable every operation
//! fails with [`BrokerError::Unavailable`], blocked reads wake up and fail, and
//! publishes are lost. Switching back on sends
//! [`SubscriptionItem::Resubscribed`] to every live subscriber.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use chorus_core::{BrokerError, DeliveryId, Fields, LogRecord};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::debug;

use crate::{Broker, GroupRead, GroupStatus, ReadStart, Subscription, SubscriptionItem};

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: Option<DeliveryId>,
    pending: BTreeMap<DeliveryId, PendingEntry>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: BTreeMap<DeliveryId, Fields>,
    last_id: (u64, u64),
    groups: HashMap<String, Group>,
}

impl Stream {
    fn next_id(&mut self) -> DeliveryId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        let (last_ms, last_seq) = self.last_id;
        self.last_id = if now > last_ms { (now, 0) } else { (last_ms, last_seq + 1) };
        DeliveryId::new(self.last_id.0, self.last_id.1)
    }

    fn last_entry(&self) -> Option<DeliveryId> {
        self.entries.keys().next_back().cloned()
    }

    fn record(&self, id: &DeliveryId) -> LogRecord {
        LogRecord::new(id.clone(), self.entries.get(id).cloned().unwrap_or_default())
    }
}

#[derive(Debug)]
struct State {
    available: AtomicBool,
    topics: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<SubscriptionItem>>>>,
    streams: Mutex<HashMap<String, Stream>>,
    changed: Notify,
}

/// Shared in-process broker.
#[derive(Clone, Debug)]
pub struct MemoryBroker {
    state: Arc<State>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Empty broker, available.
    pub fn new() -> Self {
        Self {
            state: Arc::new(State {
                available: AtomicBool::new(true),
                topics: Mutex::new(HashMap::new()),
                streams: Mutex::new(HashMap::new()),
                changed: Notify::new(),
            }),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        let was = self.state.available.swap(available, Ordering::SeqCst);
        self.state.changed.notify_waiters();
        if available && !was {
            let mut topics = self.state.topics.lock();
            for senders in topics.values_mut() {
                senders.retain(|tx| tx.send(SubscriptionItem::Resubscribed).is_ok());
            }
        }
    }

    /// Whether operations currently succeed.
    pub fn is_available(&self) -> bool {
        self.state.available.load(Ordering::SeqCst)
    }

    /// Drop every stream with its groups and pending lists, as a broker
    /// restarted without persistence would. Blocked readers wake up.
    pub fn flush(&self) {
        self.state.streams.lock().clear();
        self.state.changed.notify_waiters();
    }

    /// Entries held in `stream`.
    pub fn stream_len(&self, stream: &str) -> usize {
        self.state.streams.lock().get(stream).map_or(0, |s| s.entries.len())
    }

    /// Entries delivered to some consumer of `group` and not yet acknowledged.
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.state
            .streams
            .lock()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    /// How many times `id` has been handed to a consumer of `group`.
    pub fn delivery_count(&self, stream: &str, group: &str, id: &DeliveryId) -> u32 {
        self.state
            .streams
            .lock()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .and_then(|g| g.pending.get(id))
            .map_or(0, |p| p.deliveries)
    }

    /// Live subscribers of `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let mut topics = self.state.topics.lock();
        topics.get_mut(topic).map_or(0, |senders| {
            senders.retain(|tx| !tx.is_closed());
            senders.len()
        })
    }

    fn check(&self) -> Result<(), BrokerError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("memory broker is offline".into()))
        }
    }

    fn no_group(stream: &str, group: &str) -> BrokerError {
        BrokerError::NoGroup(format!("no such key '{stream}' or consumer group '{group}'"))
    }

    fn take_pending(&self, read: &GroupRead<'_>, after: Option<&DeliveryId>) -> Result<Vec<LogRecord>, BrokerError> {
        let mut streams = self.state.streams.lock();
        let stream = streams
            .get_mut(read.stream)
            .ok_or_else(|| Self::no_group(read.stream, read.group))?;
        let Stream { entries, groups, .. } = stream;
        let group = groups
            .get_mut(read.group)
            .ok_or_else(|| Self::no_group(read.stream, read.group))?;

        let lower = after.map_or(Bound::Unbounded, |id| Bound::Excluded(id.clone()));
        let now = Instant::now();
        let mut batch = Vec::new();
        for (id, entry) in group.pending.range_mut((lower, Bound::Unbounded)) {
            if batch.len() >= read.count {
                break;
            }
            if entry.consumer != read.consumer {
                continue;
            }
            entry.delivered_at = now;
            entry.deliveries += 1;
            batch.push(LogRecord::new(id.clone(), entries.get(id).cloned().unwrap_or_default()));
        }
        Ok(batch)
    }

    fn take_new(&self, read: &GroupRead<'_>) -> Result<Vec<LogRecord>, BrokerError> {
        let mut streams = self.state.streams.lock();
        let stream = streams
            .get_mut(read.stream)
            .ok_or_else(|| Self::no_group(read.stream, read.group))?;
        let Stream { entries, groups, .. } = stream;
        let group = groups
            .get_mut(read.group)
            .ok_or_else(|| Self::no_group(read.stream, read.group))?;

        let lower = group
            .last_delivered
            .clone()
            .map_or(Bound::Unbounded, Bound::Excluded);
        let now = Instant::now();
        let batch: Vec<LogRecord> = entries
            .range((lower, Bound::Unbounded))
            .take(read.count)
            .map(|(id, fields)| LogRecord::new(id.clone(), fields.clone()))
            .collect();
        for record in &batch {
            let _ = group.pending.insert(
                record.id.clone(),
                PendingEntry {
                    consumer: read.consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
        }
        if let Some(last) = batch.last() {
            group.last_delivered = Some(last.id.clone());
        }
        Ok(batch)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        self.check()
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.check()?;
        let mut topics = self.state.topics.lock();
        if let Some(senders) = topics.get_mut(topic) {
            senders.retain(|tx| tx.send(SubscriptionItem::Message(payload.clone())).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
        self.check()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        debug!(topic, "memory subscription opened");
        Ok(Subscription::new(topic, rx))
    }

    async fn append(&self, stream: &str, fields: &Fields) -> Result<DeliveryId, BrokerError> {
        self.check()?;
        let id = {
            let mut streams = self.state.streams.lock();
            let stream = streams.entry(stream.to_string()).or_default();
            let id = stream.next_id();
            let _ = stream.entries.insert(id.clone(), fields.clone());
            id
        };
        self.state.changed.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<GroupStatus, BrokerError> {
        self.check()?;
        let mut streams = self.state.streams.lock();
        let stream = streams.entry(stream.to_string()).or_default();
        if stream.groups.contains_key(group) {
            return Ok(GroupStatus::AlreadyExists);
        }
        let last_delivered = stream.last_entry();
        let _ = stream.groups.insert(
            group.to_string(),
            Group {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok(GroupStatus::Created)
    }

    async fn restore_group(&self, stream: &str, group: &str) -> Result<GroupStatus, BrokerError> {
        self.check()?;
        let mut streams = self.state.streams.lock();
        let stream = streams.entry(stream.to_string()).or_default();
        if stream.groups.contains_key(group) {
            return Ok(GroupStatus::AlreadyExists);
        }
        let _ = stream.groups.insert(group.to_string(), Group::default());
        Ok(GroupStatus::Created)
    }

    async fn read_group(&self, read: &GroupRead<'_>) -> Result<Vec<LogRecord>, BrokerError> {
        self.check()?;
        if let ReadStart::Pending { after } = &read.start {
            return self.take_pending(read, after.as_ref());
        }

        let deadline = Instant::now() + read.block;
        loop {
            let notified = self.state.changed.notified();
            tokio::pin!(notified);
            let _ = notified.as_mut().enable();

            self.check()?;
            let batch = self.take_new(read)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(batch);
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<LogRecord>, BrokerError> {
        self.check()?;
        let mut streams = self.state.streams.lock();
        let stream_state = streams.get_mut(stream).ok_or_else(|| Self::no_group(stream, group))?;
        let now = Instant::now();
        let mut claimed = Vec::new();
        {
            let group_state = stream_state
                .groups
                .get_mut(group)
                .ok_or_else(|| Self::no_group(stream, group))?;
            for (id, entry) in &mut group_state.pending {
                if claimed.len() >= count {
                    break;
                }
                if now.saturating_duration_since(entry.delivered_at) < min_idle {
                    continue;
                }
                entry.consumer = consumer.to_string();
                entry.delivered_at = now;
                entry.deliveries += 1;
                claimed.push(id.clone());
            }
        }
        Ok(claimed.iter().map(|id| stream_state.record(id)).collect())
    }

    async fn ack(&self, stream: &str, group: &str, id: &DeliveryId) -> Result<(), BrokerError> {
        self.check()?;
        let removed = self
            .state
            .streams
            .lock()
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .and_then(|g| g.pending.remove(id));
        match removed {
            Some(_) => Ok(()),
            None => Err(BrokerError::AckRejected { id: id.clone() }),
        }
    }

    async fn shutdown(&self) {}
}
