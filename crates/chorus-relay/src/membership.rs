//! Cluster-wide room membership.
//!
//! Local joins and leaves are announced on the control topic. Notices from
//! other processes only touch the remote view kept here; they never reach
//! the local registry and never cause an announcement of their own. Each
//! process also beacons a heartbeat, and members of a peer that goes quiet
//! for longer than the peer TTL (or says it is leaving) are dropped.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chorus_broker::{Broker, RetryPolicy, Subscription, SubscriptionItem};
use chorus_core::{
    BrokerError, ConnectionId, ControlMessage, MembershipAction, MembershipNotice, NodeId, RoomId,
};
use chorus_settings::ChorusSettings;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::registry::ConnectionRegistry;

/// Settings the replicator reads.
#[derive(Clone, Debug)]
pub struct MembershipConfig {
    /// This process.
    pub node: NodeId,
    /// Control topic.
    pub channel: String,
    /// Heartbeat period.
    pub heartbeat_interval: Duration,
    /// Silence after which a peer is forgotten.
    pub peer_ttl: Duration,
    /// Retry policy for control publishes.
    pub retry: RetryPolicy,
}

impl MembershipConfig {
    /// Derive from loaded settings.
    pub fn from_settings(settings: &ChorusSettings) -> Self {
        Self {
            node: settings.node.node_id(),
            channel: settings.broker.control_channel.clone(),
            heartbeat_interval: settings.membership.heartbeat_interval(),
            peer_ttl: settings.membership.peer_ttl(),
            retry: RetryPolicy::from_settings(&settings.broker.retry),
        }
    }
}

/// Local and remote member counts of one room.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RoomCounts {
    /// Members attached to this process.
    pub local: usize,
    /// Members on other processes.
    pub remote: usize,
}

impl RoomCounts {
    /// Members cluster-wide.
    pub fn total(&self) -> usize {
        self.local + self.remote
    }
}

/// What applying one control message did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlOutcome {
    /// Our own message looped back.
    SelfEcho,
    /// A remote member was added.
    Joined,
    /// A remote member was removed.
    Left,
    /// Join of a known member or leave of an unknown one.
    Duplicate,
    /// Heartbeat from a peer.
    PeerSeen,
    /// A peer announced it is leaving; `dropped` remote members removed.
    PeerLeft { dropped: usize },
    /// Not a control message.
    Undecodable,
}

#[derive(Debug, Default)]
struct RemoteView {
    rooms: HashMap<RoomId, HashMap<ConnectionId, NodeId>>,
    peers: HashMap<NodeId, Instant>,
}

impl RemoteView {
    fn touch(&mut self, node: &NodeId) {
        let _ = self.peers.insert(node.clone(), Instant::now());
    }

    fn drop_node(&mut self, node: &NodeId) -> usize {
        let _ = self.peers.remove(node);
        let mut dropped = 0;
        self.rooms.retain(|_, members| {
            let before = members.len();
            members.retain(|_, owner| owner != node);
            dropped += before - members.len();
            !members.is_empty()
        });
        dropped
    }
}

/// Replicates local room transitions and tracks peers' members.
pub struct MembershipReplicator {
    config: MembershipConfig,
    broker: Arc<dyn Broker>,
    registry: Arc<ConnectionRegistry>,
    remote: RwLock<RemoteView>,
    cancel: CancellationToken,
}

impl MembershipReplicator {
    /// Replicator for `registry`; background loops stop on `cancel`.
    pub fn new(
        config: MembershipConfig,
        broker: Arc<dyn Broker>,
        registry: Arc<ConnectionRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            broker,
            registry,
            remote: RwLock::new(RemoteView::default()),
            cancel,
        }
    }

    /// This process.
    pub fn node(&self) -> &NodeId {
        &self.config.node
    }

    /// Announce a local join or leave. Failures are retried, then logged.
    pub async fn announce(&self, id: &ConnectionId, room: &RoomId, action: MembershipAction) {
        let message = ControlMessage::Membership(MembershipNotice {
            room: room.clone(),
            id: id.clone(),
            action,
            node: self.config.node.clone(),
        });
        if let Err(e) = self.publish(&message).await {
            warn!(conn_id = %id, room = %room, ?action, error = %e, "membership announcement lost");
        }
    }

    /// Publish one heartbeat.
    pub async fn send_heartbeat(&self) -> Result<(), BrokerError> {
        self.publish(&ControlMessage::Heartbeat {
            node: self.config.node.clone(),
        })
        .await
    }

    /// Tell peers to forget this process's members now.
    pub async fn announce_leaving(&self) {
        let message = ControlMessage::Leaving {
            node: self.config.node.clone(),
        };
        match self.publish(&message).await {
            Ok(()) => info!(node = %self.config.node, "announced leaving"),
            Err(e) => warn!(node = %self.config.node, error = %e, "leaving announcement lost"),
        }
    }

    /// Re-send a join for every local membership. Peers treat repeats as
    /// no-ops, so this heals notices lost while the control topic was down.
    pub async fn reannounce_local(&self) -> usize {
        let memberships = self.registry.memberships().await;
        for (id, room) in &memberships {
            self.announce(id, room, MembershipAction::Join).await;
        }
        memberships.len()
    }

    async fn publish(&self, message: &ControlMessage) -> Result<(), BrokerError> {
        let payload = Bytes::from(
            message
                .to_bytes()
                .map_err(|e| BrokerError::Protocol(e.to_string()))?,
        );
        self.config
            .retry
            .run("control_publish", &self.cancel, || {
                self.broker.publish(&self.config.channel, payload.clone())
            })
            .await
    }

    /// Decode and apply one control-topic payload.
    pub fn handle_control(&self, payload: &[u8]) -> ControlOutcome {
        match ControlMessage::from_slice(payload) {
            Ok(message) => self.apply(message),
            Err(e) => {
                warn!(error = %e, "undecodable control message");
                ControlOutcome::Undecodable
            }
        }
    }

    /// Apply a control message from any process.
    pub fn apply(&self, message: ControlMessage) -> ControlOutcome {
        if message.node() == &self.config.node {
            return ControlOutcome::SelfEcho;
        }
        let mut remote = self.remote.write();
        remote.touch(message.node());
        match message {
            ControlMessage::Membership(notice) => match notice.action {
                MembershipAction::Join => {
                    let members = remote.rooms.entry(notice.room.clone()).or_default();
                    if members.insert(notice.id.clone(), notice.node.clone()).is_some() {
                        debug!(conn_id = %notice.id, room = %notice.room, node = %notice.node, "duplicate remote join");
                        ControlOutcome::Duplicate
                    } else {
                        debug!(conn_id = %notice.id, room = %notice.room, node = %notice.node, "remote join");
                        ControlOutcome::Joined
                    }
                }
                MembershipAction::Leave => {
                    let removed = match remote.rooms.get_mut(&notice.room) {
                        Some(members) => {
                            let removed = members.remove(&notice.id);
                            if members.is_empty() {
                                let _ = remote.rooms.remove(&notice.room);
                            }
                            removed
                        }
                        None => None,
                    };
                    if removed.is_some() {
                        debug!(conn_id = %notice.id, room = %notice.room, node = %notice.node, "remote leave");
                        ControlOutcome::Left
                    } else {
                        debug!(conn_id = %notice.id, room = %notice.room, node = %notice.node, "leave for unknown remote member");
                        ControlOutcome::Duplicate
                    }
                }
            },
            ControlMessage::Heartbeat { .. } => ControlOutcome::PeerSeen,
            ControlMessage::Leaving { node } => {
                let dropped = remote.drop_node(&node);
                info!(node = %node, dropped, "peer leaving");
                ControlOutcome::PeerLeft { dropped }
            }
        }
    }

    /// Drop peers silent for longer than the TTL, with all their members.
    pub fn sweep(&self) -> Vec<NodeId> {
        let ttl = self.config.peer_ttl;
        let mut remote = self.remote.write();
        let expired: Vec<NodeId> = remote
            .peers
            .iter()
            .filter(|(_, seen)| seen.elapsed() > ttl)
            .map(|(node, _)| node.clone())
            .collect();
        for node in &expired {
            let dropped = remote.drop_node(node);
            warn!(node = %node, dropped, "peer expired");
        }
        expired
    }

    /// Local and remote member counts of `room`.
    pub async fn room_counts(&self, room: &RoomId) -> RoomCounts {
        let local = self.registry.room_size(room).await;
        let remote = self.remote.read().rooms.get(room).map_or(0, HashMap::len);
        RoomCounts { local, remote }
    }

    /// Every room with a member anywhere in the cluster.
    pub async fn rooms(&self) -> Vec<RoomId> {
        let mut rooms: BTreeSet<RoomId> = self.registry.rooms().await.into_iter().collect();
        rooms.extend(self.remote.read().rooms.keys().cloned());
        rooms.into_iter().collect()
    }

    /// Peers heard from within the TTL.
    pub fn peers(&self) -> Vec<NodeId> {
        self.remote.read().peers.keys().cloned().collect()
    }

    /// Subscribe to the control topic.
    pub async fn subscribe(&self) -> Result<Subscription, BrokerError> {
        self.broker.subscribe(&self.config.channel).await
    }

    /// Control-plane loop: apply notices, beacon heartbeats, sweep peers.
    #[instrument(skip_all, fields(node = %self.config.node))]
    pub async fn run(self: Arc<Self>, mut subscription: Subscription) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.send_heartbeat().await {
                        warn!(error = %e, "heartbeat failed");
                    }
                    let _ = self.sweep();
                }
                item = subscription.next() => match item {
                    Some(SubscriptionItem::Message(payload)) => {
                        let _ = self.handle_control(&payload);
                    }
                    Some(SubscriptionItem::Resubscribed) => {
                        let count = self.reannounce_local().await;
                        warn!(reannounced = count, "control subscription restored, local memberships re-announced");
                    }
                    None => {
                        warn!("control subscription closed");
                        break;
                    }
                },
            }
        }
        debug!("membership loop stopped");
    }
}
