//! Relay engine: local occurrences go up to the broker, broker events come
//! back down to local connections.
//!
//! Every process, the origin included, receives each relayed event from the
//! broker and fans it out to all of its connections in scope except the
//! origin connection. A sender therefore never sees its own message and
//! everyone else sees it exactly once per delivery.
//!
//! In pub/sub mode events arrive on the event topic and are never
//! acknowledged. In log mode a [`GroupReader`] feeds batches; each entry is
//! acknowledged only once handled, and failed entries stay pending until the
//! visibility timeout hands them out again. With a group per process,
//! handling an entry means fanning it out locally. With one shared group the
//! process that consumed the entry re-broadcasts it on the event topic
//! instead, and every process fans out what arrives there; the delivery id
//! keeps a re-broadcast entry from being shown twice.

use std::sync::Arc;

use bytes::Bytes;
use chorus_broker::{Broker, GroupReader, GroupReaderConfig, GroupStatus, RetryPolicy, Subscription, SubscriptionItem};
use chorus_core::{
    BrokerError, ConnectionId, DeliveryId, Event, FanoutError, LogRecord, MembershipAction, NodeId,
    RoomId, ServerFrame,
};
use chorus_settings::{ChorusSettings, DeliveryMode, GapPolicy, GroupScope, LogSettings};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::dedup::DedupWindow;
use crate::membership::{MembershipConfig, MembershipReplicator};
use crate::registry::{Connection, ConnectionRegistry, FanoutReport, JoinOutcome, LeaveOutcome, LocalDelivery, Scope};
use crate::stats::{RelayStats, StatsSnapshot};

/// Everything the transport reports, funnelled through one dispatcher.
#[derive(Debug)]
pub enum Inbound {
    /// A client finished the upgrade.
    Connected(Arc<Connection>),
    /// A client sent a chat message.
    Message {
        /// Sender.
        id: ConnectionId,
        /// Payload as the client sent it.
        body: Value,
        /// Target room; broadcast when `None`.
        room: Option<RoomId>,
    },
    /// A client asked to join a room.
    Join {
        /// Requesting connection.
        id: ConnectionId,
        /// Room to join.
        room: RoomId,
    },
    /// A client asked to leave a room.
    Leave {
        /// Requesting connection.
        id: ConnectionId,
        /// Room to leave.
        room: RoomId,
    },
    /// The socket closed.
    Disconnected {
        /// Connection that went away.
        id: ConnectionId,
    },
}

impl Inbound {
    fn kind(&self) -> &'static str {
        match self {
            Self::Connected(_) => "connected",
            Self::Message { .. } => "message",
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::Disconnected { .. } => "disconnected",
        }
    }
}

/// Settings the engine reads.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// This process.
    pub node: NodeId,
    /// Pub/sub or log delivery.
    pub mode: DeliveryMode,
    /// What to do after the event subscription was re-established.
    pub gap_policy: GapPolicy,
    /// Topic carrying pub/sub events and shared-group re-broadcasts.
    pub event_channel: String,
    /// Stream, group and timing of log delivery.
    pub log: LogSettings,
    /// Room joined by every new connection.
    pub default_room: Option<RoomId>,
    /// Retry policy for publishes and appends.
    pub retry: RetryPolicy,
}

impl RelayConfig {
    /// Pick the relay settings out of the full configuration.
    pub fn from_settings(settings: &ChorusSettings) -> Self {
        Self {
            node: settings.node.node_id(),
            mode: settings.delivery.mode,
            gap_policy: settings.delivery.gap_policy,
            event_channel: settings.broker.event_channel.clone(),
            log: settings.delivery.log.clone(),
            default_room: settings.server.default_room.clone(),
            retry: RetryPolicy::from_settings(&settings.broker.retry),
        }
    }

    /// Consumer group this process reads in log mode.
    pub fn group(&self) -> String {
        self.log.group_for(&self.node)
    }

    /// Reader settings for this process's consumer.
    pub fn reader_config(&self) -> GroupReaderConfig {
        GroupReaderConfig {
            stream: self.log.stream_key.clone(),
            group: self.group(),
            consumer: self.node.to_string(),
            batch_size: self.log.batch_size,
            block: self.log.block(),
            visibility_timeout: self.log.visibility_timeout(),
            claim_interval: self.log.claim_interval(),
        }
    }

    /// Whether log entries travel to other processes over the event topic.
    fn shares_group(&self) -> bool {
        self.mode == DeliveryMode::Log && self.log.group_scope == GroupScope::Shared
    }
}

/// What happened to one log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Fanned out (or re-broadcast) and acknowledged.
    Delivered,
    /// Seen before; acknowledged without a second fan-out.
    Duplicate,
    /// Could not be decoded; acknowledged so it is not redelivered forever.
    Poisoned,
    /// Fan-out or re-broadcast failed; left pending for redelivery.
    Failed,
}

/// Moves events between local connections and the broker.
pub struct RelayEngine {
    config: RelayConfig,
    group: String,
    broker: Arc<dyn Broker>,
    registry: Arc<ConnectionRegistry>,
    delivery: Arc<dyn LocalDelivery>,
    membership: Arc<MembershipReplicator>,
    dedup: Mutex<DedupWindow>,
    /// Delivery ids already fanned out from the event topic.
    relayed: Mutex<DedupWindow>,
    stats: RelayStats,
    cancel: CancellationToken,
    /// Child of `cancel`; stops the log consumer ahead of everything else.
    consumer_cancel: CancellationToken,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl RelayEngine {
    /// Engine over an existing registry and replicator. Background loops
    /// stop when `cancel` fires.
    pub fn new(
        config: RelayConfig,
        broker: Arc<dyn Broker>,
        registry: Arc<ConnectionRegistry>,
        membership: Arc<MembershipReplicator>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            group: config.group(),
            dedup: Mutex::new(DedupWindow::new(config.log.dedup_window)),
            relayed: Mutex::new(DedupWindow::new(config.log.dedup_window)),
            config,
            broker,
            delivery: registry.clone(),
            registry,
            membership,
            stats: RelayStats::default(),
            consumer_cancel: cancel.child_token(),
            consumer: Mutex::new(None),
            cancel,
        }
    }

    /// Build the engine, a fresh registry and the membership replicator.
    pub fn from_settings(settings: &ChorusSettings, broker: Arc<dyn Broker>, cancel: CancellationToken) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let membership = Arc::new(MembershipReplicator::new(
            MembershipConfig::from_settings(settings),
            broker.clone(),
            registry.clone(),
            cancel.clone(),
        ));
        Self::new(RelayConfig::from_settings(settings), broker, registry, membership, cancel)
    }

    /// Replace the fan-out target.
    #[must_use]
    pub fn with_delivery(mut self, delivery: Arc<dyn LocalDelivery>) -> Self {
        self.delivery = delivery;
        self
    }

    /// Settings in use.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Local connection table.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Cluster-wide room membership.
    pub fn membership(&self) -> &Arc<MembershipReplicator> {
        &self.membership
    }

    /// Current relay counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Register the consumer group in log mode. An existing group is reused.
    pub async fn prepare(&self) -> Result<(), BrokerError> {
        if self.config.mode != DeliveryMode::Log {
            return Ok(());
        }
        let stream = &self.config.log.stream_key;
        match self.broker.ensure_group(stream, &self.group).await? {
            GroupStatus::Created => info!(stream = %stream, group = %self.group, "consumer group created"),
            GroupStatus::AlreadyExists => info!(stream = %stream, group = %self.group, "consumer group reused"),
        }
        Ok(())
    }

    /// Subscribe and spawn the dispatcher, the control-plane loop and the
    /// event subscriber (pub/sub or shared group) or consumer (log).
    ///
    /// The consumer's handle is kept by the engine and joined by
    /// [`drain`](Self::drain); the returned handles cover everything else.
    pub async fn start(self: &Arc<Self>, inbound: mpsc::Receiver<Inbound>) -> Result<Vec<JoinHandle<()>>, BrokerError> {
        let control = self.membership.subscribe().await?;
        let mut handles = vec![tokio::spawn(self.membership.clone().run(control))];

        if self.config.mode == DeliveryMode::PubSub || self.config.shares_group() {
            let subscription = self.broker.subscribe(&self.config.event_channel).await?;
            handles.push(tokio::spawn(self.clone().run_subscriber(subscription)));
        }
        if self.config.mode == DeliveryMode::Log {
            let reader = GroupReader::new(self.broker.clone(), self.config.reader_config(), self.config.retry.clone());
            *self.consumer.lock() = Some(tokio::spawn(self.clone().run_consumer(reader)));
        }

        handles.push(tokio::spawn(self.clone().run_dispatcher(inbound)));
        info!(node = %self.config.node, mode = ?self.config.mode, "relay started");
        Ok(handles)
    }

    async fn run_dispatcher(self: Arc<Self>, mut inbound: mpsc::Receiver<Inbound>) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                next = inbound.recv() => match next {
                    Some(item) => self.dispatch(item).await,
                    None => break,
                },
            }
        }
        debug!("dispatcher stopped");
    }

    /// Route one transport occurrence to its handler.
    #[instrument(skip_all, fields(kind = inbound.kind()))]
    pub async fn dispatch(&self, inbound: Inbound) {
        match inbound {
            Inbound::Connected(connection) => self.on_local_connect(connection).await,
            Inbound::Message { id, body, room } => self.on_local_message(&id, &body, room).await,
            Inbound::Join { id, room } => self.on_local_join(&id, &room).await,
            Inbound::Leave { id, room } => self.on_local_leave(&id, &room).await,
            Inbound::Disconnected { id } => self.on_local_disconnect(&id).await,
        }
    }

    /// Register a new connection, welcome it and announce it.
    pub async fn on_local_connect(&self, connection: Arc<Connection>) {
        let id = connection.id.clone();
        if let Err(e) = self.registry.register(connection.clone()).await {
            warn!(conn_id = %id, error = %e, "connection rejected");
            connection.close(false);
            return;
        }
        info!(conn_id = %id, "connection registered");
        self.send_frame(&id, &ServerFrame::Welcome { id: id.clone() }).await;

        if let Some(room) = self.config.default_room.clone() {
            self.on_local_join(&id, &room).await;
        }
        let _ = self.publish_event(&Event::connected(id)).await;
    }

    /// Forget a closed connection and announce its departure.
    pub async fn on_local_disconnect(&self, id: &ConnectionId) {
        let Some(rooms) = self.registry.unregister(id).await else {
            debug!(conn_id = %id, "disconnect for unknown connection");
            return;
        };
        info!(conn_id = %id, rooms = rooms.len(), "connection removed");
        for room in &rooms {
            self.membership.announce(id, room, MembershipAction::Leave).await;
        }
        let _ = self.publish_event(&Event::disconnected(id.clone())).await;
    }

    /// Publish a client message. The sender gets an error frame if it cannot be relayed.
    pub async fn on_local_message(&self, id: &ConnectionId, body: &Value, room: Option<RoomId>) {
        let event = Event::message(id.clone(), body.to_string(), room);
        if self.publish_event(&event).await.is_err() {
            self.send_frame(
                id,
                &ServerFrame::Error {
                    message: "message could not be relayed".into(),
                },
            )
            .await;
        }
    }

    /// Join a room locally and tell peers.
    pub async fn on_local_join(&self, id: &ConnectionId, room: &RoomId) {
        match self.registry.join(id, room).await {
            JoinOutcome::Joined => {
                debug!(conn_id = %id, room = %room, "joined room");
                self.membership.announce(id, room, MembershipAction::Join).await;
            }
            JoinOutcome::AlreadyMember => debug!(conn_id = %id, room = %room, "duplicate join ignored"),
            JoinOutcome::UnknownConnection => warn!(conn_id = %id, room = %room, "join from unknown connection"),
        }
    }

    /// Leave a room locally and tell peers.
    pub async fn on_local_leave(&self, id: &ConnectionId, room: &RoomId) {
        match self.registry.leave(id, room).await {
            LeaveOutcome::Left => {
                debug!(conn_id = %id, room = %room, "left room");
                self.membership.announce(id, room, MembershipAction::Leave).await;
            }
            LeaveOutcome::NotMember => debug!(conn_id = %id, room = %room, "duplicate leave ignored"),
            LeaveOutcome::UnknownConnection => warn!(conn_id = %id, room = %room, "leave from unknown connection"),
        }
    }

    /// Send an event upstream, retrying transient failures.
    pub async fn publish_event(&self, event: &Event) -> Result<(), BrokerError> {
        let result = match self.config.mode {
            DeliveryMode::PubSub => {
                let payload = Bytes::from(
                    event
                        .to_bytes()
                        .map_err(|e| BrokerError::Protocol(e.to_string()))?,
                );
                let (broker, channel) = (&self.broker, self.config.event_channel.as_str());
                self.config
                    .retry
                    .run("publish", &self.cancel, || broker.publish(channel, payload.clone()))
                    .await
            }
            DeliveryMode::Log => {
                let fields = event.to_fields();
                let (broker, stream, fields) = (&self.broker, self.config.log.stream_key.as_str(), &fields);
                self.config
                    .retry
                    .run("append", &self.cancel, || async move {
                        broker.append(stream, fields).await.map(|_| ())
                    })
                    .await
            }
        };
        match &result {
            Ok(()) => {
                self.stats.record_published();
                debug!(conn_id = %event.origin_id, kind = event.kind.as_str(), "event published");
            }
            Err(e) => {
                self.stats.record_publish_failure();
                warn!(
                    conn_id = %event.origin_id,
                    kind = event.kind.as_str(),
                    error = %e,
                    error_kind = e.error_kind(),
                    "event publish failed"
                );
            }
        }
        result
    }

    /// Fan an event out to every local connection in scope except its origin.
    pub async fn on_remote_event(&self, event: &Event) -> Result<FanoutReport, FanoutError> {
        let frame = ServerFrame::from_event(event)
            .to_json()
            .map_err(|e| FanoutError::Render(e.to_string()))?;
        let scope = Scope::excluding(&event.origin_id, event.room.as_ref());
        let report = self.delivery.deliver(Arc::new(frame), scope).await?;
        self.stats.record_fanned_out(report.delivered);
        debug!(
            conn_id = %event.origin_id,
            kind = event.kind.as_str(),
            delivered = report.delivered,
            failed = report.failed.len(),
            "event fanned out"
        );
        Ok(report)
    }

    /// Handle one item from the event subscription.
    pub async fn on_subscription_item(&self, item: SubscriptionItem) {
        match item {
            SubscriptionItem::Message(payload) => match Event::from_slice(&payload) {
                Ok(event) => {
                    if self.seen_relayed(&event) {
                        self.stats.record_duplicate();
                        debug!(delivery_id = ?event.delivery_id, "re-broadcast entry already shown");
                        return;
                    }
                    if let Err(e) = self.on_remote_event(&event).await {
                        self.stats.record_fanout_failure();
                        warn!(conn_id = %event.origin_id, error = %e, "fan-out failed");
                    }
                }
                Err(e) => {
                    self.stats.record_poisoned();
                    warn!(error = %e, "undecodable event on topic");
                }
            },
            SubscriptionItem::Resubscribed => self.on_gap().await,
        }
    }

    /// Record a re-broadcast log entry. Returns `true` if it was seen before.
    fn seen_relayed(&self, event: &Event) -> bool {
        let Some(id) = &event.delivery_id else {
            return false;
        };
        let mut window = self.relayed.lock();
        if window.contains(id) {
            return true;
        }
        let _ = window.insert(id.clone());
        false
    }

    async fn on_gap(&self) {
        self.stats.record_gap();
        warn!(
            channel = %self.config.event_channel,
            policy = ?self.config.gap_policy,
            "event subscription restored, events published meanwhile were lost"
        );
        if self.config.gap_policy != GapPolicy::NotifyClients {
            return;
        }
        match ServerFrame::Gap.to_json() {
            Ok(frame) => {
                if let Err(e) = self.delivery.deliver(Arc::new(frame), Scope::everyone()).await {
                    warn!(error = %e, "gap notification failed");
                }
            }
            Err(e) => warn!(error = %e, "gap frame could not be rendered"),
        }
    }

    /// Fan out (or, with a shared group, re-broadcast) one log entry and
    /// acknowledge it when appropriate.
    #[instrument(skip_all, fields(delivery_id = %record.id))]
    pub async fn process_record(&self, record: &LogRecord) -> RecordOutcome {
        if self.dedup.lock().contains(&record.id) {
            self.stats.record_duplicate();
            debug!("duplicate delivery acknowledged without fan-out");
            self.ack(&record.id).await;
            return RecordOutcome::Duplicate;
        }

        let event = match record.decode() {
            Ok(event) => event,
            Err(e) => {
                self.stats.record_poisoned();
                error!(error = %e, fields = ?record.fields, "undecodable log entry, acknowledging");
                self.ack(&record.id).await;
                return RecordOutcome::Poisoned;
            }
        };

        let handled = match self.config.log.group_scope {
            GroupScope::PerNode => match self.on_remote_event(&event).await {
                Ok(_) => true,
                Err(e) => {
                    self.stats.record_fanout_failure();
                    warn!(error = %e, "fan-out failed, entry left pending for redelivery");
                    false
                }
            },
            GroupScope::Shared => self.relay(&event).await,
        };
        if !handled {
            return RecordOutcome::Failed;
        }
        let _ = self.dedup.lock().insert(record.id.clone());
        self.ack(&record.id).await;
        RecordOutcome::Delivered
    }

    /// Hand a consumed entry to every process over the event topic.
    async fn relay(&self, event: &Event) -> bool {
        let payload = match event.to_bytes() {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!(error = %e, "entry could not be encoded for re-broadcast");
                return false;
            }
        };
        let (broker, channel) = (&self.broker, self.config.event_channel.as_str());
        match self
            .config
            .retry
            .run("relay", &self.cancel, || broker.publish(channel, payload.clone()))
            .await
        {
            Ok(()) => {
                self.stats.record_relayed();
                debug!(channel, "entry re-broadcast");
                true
            }
            Err(e) => {
                warn!(error = %e, error_kind = e.error_kind(), "re-broadcast failed, entry left pending for redelivery");
                false
            }
        }
    }

    async fn ack(&self, id: &DeliveryId) {
        match self.broker.ack(&self.config.log.stream_key, &self.group, id).await {
            Ok(()) => self.stats.record_acked(),
            Err(e) => {
                self.stats.record_ack_failure();
                warn!(delivery_id = %id, error = %e, error_kind = e.error_kind(), "ack failed, broker will redeliver");
            }
        }
    }

    async fn run_subscriber(self: Arc<Self>, mut subscription: Subscription) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                item = subscription.next() => match item {
                    Some(item) => self.on_subscription_item(item).await,
                    None => {
                        warn!(channel = %self.config.event_channel, "event subscription closed");
                        break;
                    }
                },
            }
        }
        debug!("subscriber stopped");
    }

    async fn run_consumer(self: Arc<Self>, reader: GroupReader) {
        let batches = reader.into_stream(self.consumer_cancel.clone());
        futures::pin_mut!(batches);
        while let Some(batch) = batches.next().await {
            for record in &batch {
                let _ = self.process_record(record).await;
            }
        }
        info!(group = %self.group, "consumer stopped");
    }

    /// Stop the log consumer and wait for the batch in hand to finish.
    async fn stop_consumer(&self) {
        self.consumer_cancel.cancel();
        let consumer = self.consumer.lock().take();
        if let Some(handle) = consumer {
            if let Err(e) = handle.await {
                warn!(error = %e, "consumer task failed");
            }
        }
    }

    /// Stop consuming, then close every local connection and tell peers
    /// about it. Returns the number of connections closed.
    ///
    /// Entries appended from here on stay unread in this process's group
    /// rather than pending against a closed registry.
    #[instrument(skip_all, fields(node = %self.config.node))]
    pub async fn drain(&self) -> usize {
        self.stop_consumer().await;
        let closed = self.registry.close_all(false).await;
        let mut leaves = 0;
        for (id, rooms) in &closed {
            for room in rooms {
                self.membership.announce(id, room, MembershipAction::Leave).await;
                leaves += 1;
            }
            let _ = self.publish_event(&Event::disconnected(id.clone())).await;
        }
        self.membership.announce_leaving().await;
        info!(connections = closed.len(), leaves, stats = ?self.stats.snapshot(), "relay drained");
        closed.len()
    }

    async fn send_frame(&self, id: &ConnectionId, frame: &ServerFrame) {
        let json = match frame.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(conn_id = %id, error = %e, "frame could not be rendered");
                return;
            }
        };
        if let Err(e) = self.registry.send_to(id, Arc::new(json)).await {
            warn!(conn_id = %id, error = %e, "direct send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Outbound;
    use async_trait::async_trait;
    use chorus_broker::MemoryBroker;
    use chorus_core::{ControlMessage, Fields};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn settings(node: &str, mode: DeliveryMode) -> ChorusSettings {
        let mut s = ChorusSettings::default();
        s.node.name = Some(node.into());
        s.broker.url = "memory://".into();
        s.broker.retry.max_retries = 1;
        s.broker.retry.base_delay_ms = 1;
        s.broker.retry.max_delay_ms = 2;
        s.delivery.mode = mode;
        s.delivery.log.block_ms = 20;
        s.delivery.log.claim_interval_ms = 20;
        s.delivery.log.visibility_timeout_ms = 50;
        s
    }

    fn shared(node: &str) -> ChorusSettings {
        let mut s = settings(node, DeliveryMode::Log);
        s.delivery.log.group_scope = GroupScope::Shared;
        s
    }

    struct Node {
        engine: Arc<RelayEngine>,
        inbound: mpsc::Sender<Inbound>,
        cancel: CancellationToken,
    }

    impl Drop for Node {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    async fn start(engine: RelayEngine, cancel: CancellationToken) -> Node {
        let engine = Arc::new(engine);
        engine.prepare().await.unwrap();
        let (tx, rx) = mpsc::channel(64);
        let _ = engine.start(rx).await.unwrap();
        Node {
            engine,
            inbound: tx,
            cancel,
        }
    }

    async fn start_node(broker: &MemoryBroker, settings: &ChorusSettings) -> Node {
        let cancel = CancellationToken::new();
        let engine = RelayEngine::from_settings(settings, Arc::new(broker.clone()), cancel.clone());
        start(engine, cancel).await
    }

    /// Attach a connection and wait for its welcome frame.
    async fn connect(node: &Node, id: &str) -> mpsc::Receiver<Outbound> {
        let (tx, mut rx) = mpsc::channel(64);
        let connection = Arc::new(Connection::new(ConnectionId::from(id), tx));
        node.engine.dispatch(Inbound::Connected(connection)).await;
        let welcome = next_frame(&mut rx, "welcome").await;
        assert_eq!(welcome["id"], id);
        rx
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Outbound>, kind: &str) -> Value {
        tokio::time::timeout(WAIT, async {
            loop {
                match rx.recv().await {
                    Some(Outbound::Text(text)) => {
                        let frame: Value = serde_json::from_str(&text).unwrap();
                        if frame["type"] == kind {
                            return frame;
                        }
                    }
                    Some(Outbound::Close) => panic!("connection closed while waiting for {kind}"),
                    None => panic!("queue closed while waiting for {kind}"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {kind} frame within {WAIT:?}"))
    }

    async fn no_frame(rx: &mut mpsc::Receiver<Outbound>, kind: &str, within: Duration) -> bool {
        tokio::time::timeout(within, next_frame(rx, kind)).await.is_err()
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !check().await {
            assert!(tokio::time::Instant::now() < deadline, "condition not met within {WAIT:?}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn message(id: &str, body: Value, room: Option<&str>) -> Inbound {
        Inbound::Message {
            id: ConnectionId::from(id),
            body,
            room: room.map(RoomId::from),
        }
    }

    /// Fails the first `failures` chat-message deliveries.
    struct FlakyDelivery {
        inner: Arc<ConnectionRegistry>,
        failures: AtomicU32,
    }

    #[async_trait]
    impl LocalDelivery for FlakyDelivery {
        async fn deliver(&self, frame: Arc<String>, scope: Scope<'_>) -> Result<FanoutReport, FanoutError> {
            let is_message = frame.contains(r#""type":"message""#);
            if is_message
                && self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(FanoutError::Render("injected failure".into()));
            }
            self.inner.deliver(frame, scope).await
        }
    }

    #[tokio::test]
    async fn message_reaches_other_process_but_not_sender() {
        let broker = MemoryBroker::new();
        let p1 = start_node(&broker, &settings("p1", DeliveryMode::PubSub)).await;
        let p2 = start_node(&broker, &settings("p2", DeliveryMode::PubSub)).await;
        let mut a = connect(&p1, "a").await;
        let mut b = connect(&p2, "b").await;
        let mut c = connect(&p1, "c").await;

        p1.engine.dispatch(message("a", serde_json::json!({"text": "hi"}), None)).await;

        let on_b = next_frame(&mut b, "message").await;
        assert_eq!(on_b["from"], "a");
        assert_eq!(on_b["body"]["text"], "hi");
        let on_c = next_frame(&mut c, "message").await;
        assert_eq!(on_c["body"]["text"], "hi");
        assert!(no_frame(&mut a, "message", Duration::from_millis(100)).await);
        assert!(no_frame(&mut b, "message", Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn every_connection_gets_one_copy_in_publish_order() {
        let broker = MemoryBroker::new();
        let p1 = start_node(&broker, &settings("p1", DeliveryMode::PubSub)).await;
        let p2 = start_node(&broker, &settings("p2", DeliveryMode::PubSub)).await;
        let _a = connect(&p1, "a").await;
        let mut b = connect(&p2, "b").await;
        let mut c = connect(&p2, "c").await;

        for n in 0..20 {
            p1.inbound.send(message("a", serde_json::json!(n), None)).await.unwrap();
        }
        for rx in [&mut b, &mut c] {
            for n in 0..20 {
                assert_eq!(next_frame(rx, "message").await["body"], n);
            }
            assert!(no_frame(rx, "message", Duration::from_millis(50)).await);
        }
    }

    #[tokio::test]
    async fn room_messages_stay_in_room() {
        let broker = MemoryBroker::new();
        let p1 = start_node(&broker, &settings("p1", DeliveryMode::PubSub)).await;
        let p2 = start_node(&broker, &settings("p2", DeliveryMode::PubSub)).await;
        let _a = connect(&p1, "a").await;
        let mut member = connect(&p2, "member").await;
        let mut outsider = connect(&p2, "outsider").await;
        p2.engine
            .dispatch(Inbound::Join {
                id: ConnectionId::from("member"),
                room: RoomId::from("lobby"),
            })
            .await;

        p1.engine.dispatch(message("a", serde_json::json!("psst"), Some("lobby"))).await;
        let frame = next_frame(&mut member, "message").await;
        assert_eq!(frame["room"], "lobby");
        assert_eq!(frame["body"], "psst");
        assert!(no_frame(&mut outsider, "message", Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn presence_events_reach_peers() {
        let broker = MemoryBroker::new();
        let p1 = start_node(&broker, &settings("p1", DeliveryMode::PubSub)).await;
        let p2 = start_node(&broker, &settings("p2", DeliveryMode::PubSub)).await;
        let mut watcher = connect(&p2, "watcher").await;
        let _a = connect(&p1, "a").await;

        let joined = next_frame(&mut watcher, "presence").await;
        assert_eq!(joined["id"], "a");
        assert_eq!(joined["status"], "connected");

        p1.engine
            .dispatch(Inbound::Disconnected {
                id: ConnectionId::from("a"),
            })
            .await;
        let left = next_frame(&mut watcher, "presence").await;
        assert_eq!(left["id"], "a");
        assert_eq!(left["status"], "disconnected");
    }

    #[tokio::test]
    async fn remote_join_is_recorded_without_touching_local_registry() {
        let broker = MemoryBroker::new();
        let p1 = start_node(&broker, &settings("p1", DeliveryMode::PubSub)).await;
        let p2 = start_node(&broker, &settings("p2", DeliveryMode::PubSub)).await;
        let _a = connect(&p1, "a").await;
        let _b = connect(&p2, "b").await;
        let lobby = RoomId::from("lobby");

        p1.engine
            .dispatch(Inbound::Join {
                id: ConnectionId::from("a"),
                room: lobby.clone(),
            })
            .await;

        let membership = p2.engine.membership().clone();
        let watched = lobby.clone();
        eventually(|| {
            let membership = membership.clone();
            let room = watched.clone();
            async move { membership.room_counts(&room).await.remote == 1 }
        })
        .await;
        assert_eq!(p2.engine.registry().room_size(&lobby).await, 0);
        assert_eq!(p2.engine.registry().connection_count().await, 1);
        // The joining process counts it locally, not remotely.
        let counts = p1.engine.membership().room_counts(&lobby).await;
        assert_eq!((counts.local, counts.remote), (1, 0));
    }

    #[tokio::test]
    async fn disconnect_announces_leave_for_every_room() {
        let broker = MemoryBroker::new();
        let mut control = broker.subscribe("chorus:control").await.unwrap();
        let p1 = start_node(&broker, &settings("p1", DeliveryMode::PubSub)).await;
        let _a = connect(&p1, "a").await;
        for room in ["x", "y"] {
            p1.engine
                .dispatch(Inbound::Join {
                    id: ConnectionId::from("a"),
                    room: RoomId::from(room),
                })
                .await;
        }
        p1.engine
            .dispatch(Inbound::Disconnected {
                id: ConnectionId::from("a"),
            })
            .await;

        let mut leaves = Vec::new();
        while leaves.len() < 2 {
            let item = tokio::time::timeout(WAIT, control.next()).await.unwrap().unwrap();
            if let SubscriptionItem::Message(payload) = item {
                if let ControlMessage::Membership(notice) = ControlMessage::from_slice(&payload).unwrap() {
                    if notice.action == MembershipAction::Leave {
                        leaves.push(notice.room.to_string());
                    }
                }
            }
        }
        leaves.sort();
        assert_eq!(leaves, ["x", "y"]);
        assert_eq!(p1.engine.registry().connection_count().await, 0);
    }

    #[tokio::test]
    async fn default_room_is_joined_on_connect() {
        let broker = MemoryBroker::new();
        let mut s = settings("p1", DeliveryMode::PubSub);
        s.server.default_room = Some(RoomId::from("lobby"));
        let p1 = start_node(&broker, &s).await;
        let _a = connect(&p1, "a").await;
        assert_eq!(p1.engine.registry().rooms_of(&ConnectionId::from("a")).await, vec![RoomId::from("lobby")]);
    }

    #[tokio::test]
    async fn publish_failure_tells_the_sender() {
        let broker = MemoryBroker::new();
        let p1 = start_node(&broker, &settings("p1", DeliveryMode::PubSub)).await;
        let mut a = connect(&p1, "a").await;

        broker.set_available(false);
        p1.engine.dispatch(message("a", serde_json::json!("lost"), None)).await;
        let frame = next_frame(&mut a, "error").await;
        assert_eq!(frame["message"], "message could not be relayed");
        assert_eq!(p1.engine.stats().publish_failures, 1);
    }

    #[tokio::test]
    async fn gap_is_reported_to_clients_when_configured() {
        let broker = MemoryBroker::new();
        let mut s = settings("p1", DeliveryMode::PubSub);
        s.delivery.gap_policy = GapPolicy::NotifyClients;
        let p1 = start_node(&broker, &s).await;
        let mut a = connect(&p1, "a").await;

        broker.set_available(false);
        broker.set_available(true);
        let _ = next_frame(&mut a, "gap").await;
        let engine = p1.engine.clone();
        eventually(|| {
            let engine = engine.clone();
            async move { engine.stats().gaps >= 1 }
        })
        .await;
    }

    #[tokio::test]
    async fn gap_is_only_logged_by_default() {
        let broker = MemoryBroker::new();
        let p1 = start_node(&broker, &settings("p1", DeliveryMode::PubSub)).await;
        let mut a = connect(&p1, "a").await;

        broker.set_available(false);
        broker.set_available(true);
        assert!(no_frame(&mut a, "gap", Duration::from_millis(100)).await);
        assert!(p1.engine.stats().gaps >= 1);
    }

    #[tokio::test]
    async fn log_mode_delivers_and_acknowledges() {
        let broker = MemoryBroker::new();
        let p1 = start_node(&broker, &settings("p1", DeliveryMode::Log)).await;
        let _a = connect(&p1, "a").await;
        let mut b = connect(&p1, "b").await;

        p1.engine.dispatch(message("a", serde_json::json!({"text": "durable"}), None)).await;
        assert_eq!(next_frame(&mut b, "message").await["body"]["text"], "durable");

        let broker_view = broker.clone();
        eventually(|| {
            let broker = broker_view.clone();
            async move { broker.pending_count("chorus:stream", "chorus:p1") == 0 }
        })
        .await;
        assert!(p1.engine.stats().acked >= 1);
    }

    #[tokio::test]
    async fn log_mode_reaches_connections_on_every_process() {
        let broker = MemoryBroker::new();
        let p1 = start_node(&broker, &settings("p1", DeliveryMode::Log)).await;
        let p2 = start_node(&broker, &settings("p2", DeliveryMode::Log)).await;
        let mut a = connect(&p1, "a").await;
        let mut b = connect(&p2, "b").await;

        for n in 0..10 {
            p1.inbound.send(message("a", serde_json::json!(n), None)).await.unwrap();
        }
        for n in 0..10 {
            assert_eq!(next_frame(&mut b, "message").await["body"], n);
        }
        assert!(no_frame(&mut b, "message", Duration::from_millis(100)).await);
        assert!(no_frame(&mut a, "message", Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn shared_group_rebroadcasts_to_every_process() {
        let broker = MemoryBroker::new();
        let p1 = start_node(&broker, &shared("p1")).await;
        let p2 = start_node(&broker, &shared("p2")).await;
        let _a = connect(&p1, "a").await;
        let mut b = connect(&p1, "b").await;
        let mut c = connect(&p2, "c").await;

        for n in 0..5 {
            p1.inbound.send(message("a", serde_json::json!(n), None)).await.unwrap();
        }
        // Either process may consume a given entry, so only the set is fixed.
        for rx in [&mut b, &mut c] {
            let mut bodies = Vec::new();
            for _ in 0..5 {
                bodies.push(next_frame(rx, "message").await["body"].as_i64().unwrap());
            }
            bodies.sort_unstable();
            assert_eq!(bodies, [0, 1, 2, 3, 4]);
            assert!(no_frame(rx, "message", Duration::from_millis(100)).await);
        }

        let broker_view = broker.clone();
        eventually(|| {
            let broker = broker_view.clone();
            async move { broker.pending_count("chorus:stream", "chorus") == 0 }
        })
        .await;
        assert!(p1.engine.stats().relayed + p2.engine.stats().relayed >= 5);
    }

    #[tokio::test]
    async fn rebroadcast_entry_is_shown_once() {
        let broker = MemoryBroker::new();
        let engine = RelayEngine::from_settings(&shared("p1"), Arc::new(broker.clone()), CancellationToken::new());
        let (tx, mut rx) = mpsc::channel(16);
        engine
            .on_local_connect(Arc::new(Connection::new(ConnectionId::from("b"), tx)))
            .await;
        let _ = next_frame(&mut rx, "welcome").await;

        let mut event = Event::message(ConnectionId::from("a"), "\"hello\"", None);
        event.delivery_id = Some(DeliveryId::new(7, 0));
        let payload = Bytes::from(event.to_bytes().unwrap());
        engine.on_subscription_item(SubscriptionItem::Message(payload.clone())).await;
        engine.on_subscription_item(SubscriptionItem::Message(payload)).await;

        assert_eq!(next_frame(&mut rx, "message").await["body"], "hello");
        assert!(no_frame(&mut rx, "message", Duration::from_millis(50)).await);
        assert_eq!(engine.stats().duplicates, 1);
    }

    #[tokio::test]
    async fn shared_group_entry_is_acknowledged_after_rebroadcast() {
        let broker = MemoryBroker::new();
        let engine = RelayEngine::from_settings(&shared("p1"), Arc::new(broker.clone()), CancellationToken::new());
        engine.prepare().await.unwrap();
        let mut topic = broker.subscribe("chorus:events").await.unwrap();

        engine
            .publish_event(&Event::message(ConnectionId::from("a"), "\"x\"", None))
            .await
            .unwrap();
        let batch = broker
            .read_group(&chorus_broker::GroupRead {
                stream: "chorus:stream",
                group: "chorus",
                consumer: "p1",
                start: chorus_broker::ReadStart::New,
                count: 10,
                block: Duration::ZERO,
            })
            .await
            .unwrap();

        assert_eq!(engine.process_record(&batch[0]).await, RecordOutcome::Delivered);
        assert_eq!(broker.pending_count("chorus:stream", "chorus"), 0);
        let item = tokio::time::timeout(WAIT, topic.next()).await.unwrap().unwrap();
        let payload = match item {
            SubscriptionItem::Message(payload) => payload,
            SubscriptionItem::Resubscribed => panic!("expected a message, got a resubscribe marker"),
        };
        let relayed = Event::from_slice(&payload).unwrap();
        assert_eq!(relayed.delivery_id, Some(batch[0].id.clone()));
        assert_eq!(relayed.payload, "\"x\"");
    }

    #[tokio::test]
    async fn failed_rebroadcast_leaves_entry_pending() {
        let broker = MemoryBroker::new();
        let engine = RelayEngine::from_settings(&shared("p1"), Arc::new(broker.clone()), CancellationToken::new());
        engine.prepare().await.unwrap();
        engine
            .publish_event(&Event::message(ConnectionId::from("a"), "\"x\"", None))
            .await
            .unwrap();
        let batch = broker
            .read_group(&chorus_broker::GroupRead {
                stream: "chorus:stream",
                group: "chorus",
                consumer: "p1",
                start: chorus_broker::ReadStart::New,
                count: 10,
                block: Duration::ZERO,
            })
            .await
            .unwrap();

        broker.set_available(false);
        assert_eq!(engine.process_record(&batch[0]).await, RecordOutcome::Failed);
        broker.set_available(true);
        assert_eq!(broker.pending_count("chorus:stream", "chorus"), 1);
        assert_eq!(engine.stats().relayed, 0);
    }

    #[tokio::test]
    async fn failed_fanout_is_redelivered_until_it_succeeds() {
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();
        let engine = RelayEngine::from_settings(&settings("p1", DeliveryMode::Log), Arc::new(broker.clone()), cancel.clone());
        let flaky = Arc::new(FlakyDelivery {
            inner: engine.registry().clone(),
            failures: AtomicU32::new(2),
        });
        let p1 = start(engine.with_delivery(flaky), cancel).await;
        let _a = connect(&p1, "a").await;
        let mut b = connect(&p1, "b").await;

        p1.engine.dispatch(message("a", serde_json::json!("retry me"), None)).await;

        assert_eq!(next_frame(&mut b, "message").await["body"], "retry me");
        assert!(no_frame(&mut b, "message", Duration::from_millis(150)).await);
        let stats = p1.engine.stats();
        assert_eq!(stats.fanout_failures, 2);
        assert_eq!(broker.pending_count("chorus:stream", "chorus:p1"), 0);
    }

    #[tokio::test]
    async fn nothing_is_acknowledged_before_fanout_succeeds() {
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();
        let engine = RelayEngine::from_settings(&settings("p1", DeliveryMode::Log), Arc::new(broker.clone()), cancel.clone());
        let flaky = Arc::new(FlakyDelivery {
            inner: engine.registry().clone(),
            failures: AtomicU32::new(1),
        });
        let engine = engine.with_delivery(flaky);
        engine.prepare().await.unwrap();

        engine
            .publish_event(&Event::message(ConnectionId::from("a"), "\"x\"", None))
            .await
            .unwrap();
        let batch = broker
            .read_group(&chorus_broker::GroupRead {
                stream: "chorus:stream",
                group: "chorus:p1",
                consumer: "p1",
                start: chorus_broker::ReadStart::New,
                count: 10,
                block: Duration::ZERO,
            })
            .await
            .unwrap();

        assert_eq!(engine.process_record(&batch[0]).await, RecordOutcome::Failed);
        assert_eq!(broker.pending_count("chorus:stream", "chorus:p1"), 1);
        assert_eq!(engine.process_record(&batch[0]).await, RecordOutcome::Delivered);
        assert_eq!(broker.pending_count("chorus:stream", "chorus:p1"), 0);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_acknowledged_without_second_fanout() {
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();
        let engine = RelayEngine::from_settings(&settings("p1", DeliveryMode::Log), Arc::new(broker.clone()), cancel);
        engine.prepare().await.unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        engine
            .on_local_connect(Arc::new(Connection::new(ConnectionId::from("b"), tx)))
            .await;
        engine.on_local_join(&ConnectionId::from("b"), &RoomId::from("lobby")).await;
        let _ = next_frame(&mut rx, "welcome").await;

        engine
            .publish_event(&Event::message(ConnectionId::from("a"), "\"once\"", None))
            .await
            .unwrap();
        let read = chorus_broker::GroupRead {
            stream: "chorus:stream",
            group: "chorus:p1",
            consumer: "p1",
            start: chorus_broker::ReadStart::New,
            count: 10,
            block: Duration::ZERO,
        };
        let batch = broker.read_group(&read).await.unwrap();
        let record = batch.iter().find(|r| r.fields["message"] == "\"once\"").unwrap().clone();

        assert_eq!(engine.process_record(&record).await, RecordOutcome::Delivered);
        assert_eq!(engine.process_record(&record).await, RecordOutcome::Duplicate);

        assert_eq!(next_frame(&mut rx, "message").await["body"], "once");
        assert!(no_frame(&mut rx, "message", Duration::from_millis(50)).await);
        assert_eq!(engine.registry().connection_count().await, 1);
        let counts = engine.membership().room_counts(&RoomId::from("lobby")).await;
        assert_eq!((counts.local, counts.remote), (1, 0));
        assert_eq!(engine.stats().duplicates, 1);
    }

    #[tokio::test]
    async fn undecodable_entry_is_acknowledged() {
        let broker = MemoryBroker::new();
        let engine = RelayEngine::from_settings(
            &settings("p1", DeliveryMode::Log),
            Arc::new(broker.clone()),
            CancellationToken::new(),
        );
        engine.prepare().await.unwrap();
        let mut junk = Fields::new();
        let _ = junk.insert("unexpected".into(), "value".into());
        let _ = broker.append("chorus:stream", &junk).await.unwrap();
        let batch = broker
            .read_group(&chorus_broker::GroupRead {
                stream: "chorus:stream",
                group: "chorus:p1",
                consumer: "p1",
                start: chorus_broker::ReadStart::New,
                count: 10,
                block: Duration::ZERO,
            })
            .await
            .unwrap();

        assert_eq!(engine.process_record(&batch[0]).await, RecordOutcome::Poisoned);
        assert_eq!(broker.pending_count("chorus:stream", "chorus:p1"), 0);
        assert_eq!(engine.stats().poisoned, 1);
    }

    #[tokio::test]
    async fn consumer_resumes_after_outage_without_replaying_acked_entries() {
        let broker = MemoryBroker::new();
        let p1 = start_node(&broker, &settings("p1", DeliveryMode::Log)).await;
        let _a = connect(&p1, "a").await;
        let mut b = connect(&p1, "b").await;

        p1.engine.dispatch(message("a", serde_json::json!("before"), None)).await;
        assert_eq!(next_frame(&mut b, "message").await["body"], "before");

        broker.set_available(false);
        tokio::time::sleep(Duration::from_millis(60)).await;
        broker.set_available(true);

        p1.engine.dispatch(message("a", serde_json::json!("after"), None)).await;
        assert_eq!(next_frame(&mut b, "message").await["body"], "after");
        assert!(no_frame(&mut b, "message", Duration::from_millis(150)).await);
    }

    #[tokio::test]
    async fn drain_closes_connections_and_announces_departure() {
        let broker = MemoryBroker::new();
        let mut control = broker.subscribe("chorus:control").await.unwrap();
        let p1 = start_node(&broker, &settings("p1", DeliveryMode::PubSub)).await;
        let mut a = connect(&p1, "a").await;
        p1.engine
            .dispatch(Inbound::Join {
                id: ConnectionId::from("a"),
                room: RoomId::from("lobby"),
            })
            .await;

        assert_eq!(p1.engine.drain().await, 1);

        let closed = tokio::time::timeout(WAIT, async {
            loop {
                if let Some(Outbound::Close) | None = a.recv().await {
                    return;
                }
            }
        })
        .await;
        assert!(closed.is_ok());

        let mut saw_leave = false;
        let mut saw_leaving = false;
        while !(saw_leave && saw_leaving) {
            let item = tokio::time::timeout(WAIT, control.next()).await.unwrap().unwrap();
            if let SubscriptionItem::Message(payload) = item {
                match ControlMessage::from_slice(&payload).unwrap() {
                    ControlMessage::Membership(n) if n.action == MembershipAction::Leave => saw_leave = true,
                    ControlMessage::Leaving { node } => {
                        assert_eq!(node.as_str(), "p1");
                        saw_leaving = true;
                    }
                    _ => {}
                }
            }
        }
        assert!(p1.engine.registry().is_closed().await);
    }

    #[tokio::test]
    async fn drain_stops_consuming_before_connections_close() {
        let broker = MemoryBroker::new();
        let p1 = start_node(&broker, &settings("p1", DeliveryMode::Log)).await;
        let _a = connect(&p1, "a").await;

        let writer = {
            let broker = broker.clone();
            tokio::spawn(async move {
                for n in 0..40 {
                    let event = Event::message(ConnectionId::from("x"), n.to_string(), None);
                    let _ = broker.append("chorus:stream", &event.to_fields()).await.unwrap();
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(p1.engine.drain().await, 1);
        writer.await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(broker.pending_count("chorus:stream", "chorus:p1"), 0);
        assert_eq!(p1.engine.stats().fanout_failures, 0);
        assert!(p1.engine.consumer.lock().is_none());
    }
}
