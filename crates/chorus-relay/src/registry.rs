//! Per-process table of attached connections and the rooms they joined.
//!
//! Purely local: nothing here is replicated, and a restarted process starts
//! with an empty registry. Writers (connect, disconnect, join, leave) take the
//! write lock; fan-out takes a read lock and never awaits while holding it.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chorus_core::{ConnectionId, FanoutError, RoomId};
use parking_lot::Mutex;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Item queued for a connection's socket writer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// A serialized server frame.
    Text(Arc<String>),
    /// Send a close frame and stop writing.
    Close,
}

/// One attached client connection.
pub struct Connection {
    /// Process-unique connection id.
    pub id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    /// When the connection registered.
    pub connected_at: Instant,
    is_alive: AtomicBool,
    last_pong: Mutex<Instant>,
    dropped_messages: AtomicU64,
    closer: CancellationToken,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wrap the sending half of the outbound queue.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Outbound>) -> Self {
        let now = Instant::now();
        Self {
            id,
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
            closer: CancellationToken::new(),
        }
    }

    /// Queue a frame without waiting. A full or closed queue counts as a
    /// dropped message and is reported as a per-connection failure.
    pub fn send(&self, frame: Arc<String>) -> Result<(), FanoutError> {
        if self.is_closed() {
            return Err(self.failure("connection closed"));
        }
        match self.tx.try_send(Outbound::Text(frame)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(self.failure("send queue full"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(self.failure("send queue closed"))
            }
        }
    }

    /// Close the connection. Graceful close queues a close frame behind
    /// pending output; forced close (or a full queue) stops the writer now.
    pub fn close(&self, force: bool) {
        if force || self.tx.try_send(Outbound::Close).is_err() {
            self.closer.cancel();
        }
    }

    /// Whether `close` has run or the writer stopped.
    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }

    /// Token cancelled on forced close; the transport tasks select on it.
    pub fn closed_token(&self) -> CancellationToken {
        self.closer.clone()
    }

    /// Frames dropped because the queue was full or closed.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Mark the connection as alive (pong or any inbound activity).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Check and reset the alive flag. Returns `true` if the client showed
    /// activity since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the last pong or inbound frame.
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    fn failure(&self, reason: &str) -> FanoutError {
        FanoutError::Connection {
            connection_id: self.id.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Which local connections a fan-out targets.
#[derive(Clone, Copy, Debug, Default)]
pub struct Scope<'a> {
    /// Only members of this room; every connection when `None`.
    pub room: Option<&'a RoomId>,
    /// Never deliver to this connection (the event's origin).
    pub exclude: Option<&'a ConnectionId>,
}

impl<'a> Scope<'a> {
    /// Every local connection.
    pub fn everyone() -> Self {
        Self::default()
    }

    /// Everyone in `room` (or everyone) except `origin`.
    pub fn excluding(origin: &'a ConnectionId, room: Option<&'a RoomId>) -> Self {
        Self {
            room,
            exclude: Some(origin),
        }
    }
}

/// Result of one fan-out.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Connections that accepted the frame.
    pub delivered: usize,
    /// Connections that could not accept the frame; they have been closed.
    pub failed: Vec<ConnectionId>,
}

/// Hands rendered frames to local connections.
#[async_trait]
pub trait LocalDelivery: Send + Sync {
    /// Deliver `frame` to every connection in `scope`. Per-connection failures
    /// are isolated and reported; an `Err` means nothing was delivered.
    async fn deliver(&self, frame: Arc<String>, scope: Scope<'_>) -> Result<FanoutReport, FanoutError>;
}

/// Outcome of [`ConnectionRegistry::join`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Added to the room.
    Joined,
    /// Already in the room.
    AlreadyMember,
    /// The connection is not registered.
    UnknownConnection,
}

/// Outcome of [`ConnectionRegistry::leave`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// Removed from the room.
    Left,
    /// Was not in the room.
    NotMember,
    /// The connection is not registered.
    UnknownConnection,
}

struct Member {
    connection: Arc<Connection>,
    rooms: BTreeSet<RoomId>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Member>,
    rooms: HashMap<RoomId, BTreeSet<ConnectionId>>,
    closed: bool,
}

impl Inner {
    fn drop_from_room(&mut self, room: &RoomId, id: &ConnectionId) {
        if let Some(members) = self.rooms.get_mut(room) {
            let _ = members.remove(id);
            if members.is_empty() {
                let _ = self.rooms.remove(room);
            }
        }
    }
}

/// Local connection table.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
}

impl ConnectionRegistry {
    /// An empty, open registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. Fails with [`FanoutError::Closed`] once draining.
    pub async fn register(&self, connection: Arc<Connection>) -> Result<(), FanoutError> {
        let mut inner = self.inner.write().await;
        if inner.closed {
            return Err(FanoutError::Closed);
        }
        let id = connection.id.clone();
        let _ = inner.connections.insert(
            id,
            Member {
                connection,
                rooms: BTreeSet::new(),
            },
        );
        Ok(())
    }

    /// Remove a connection, returning the rooms it was in, or `None` if it
    /// was not registered.
    pub async fn unregister(&self, id: &ConnectionId) -> Option<Vec<RoomId>> {
        let mut inner = self.inner.write().await;
        let member = inner.connections.remove(id)?;
        for room in &member.rooms {
            inner.drop_from_room(room, id);
        }
        Some(member.rooms.into_iter().collect())
    }

    /// Add `id` to `room`.
    pub async fn join(&self, id: &ConnectionId, room: &RoomId) -> JoinOutcome {
        let mut inner = self.inner.write().await;
        let Some(member) = inner.connections.get_mut(id) else {
            return JoinOutcome::UnknownConnection;
        };
        if !member.rooms.insert(room.clone()) {
            return JoinOutcome::AlreadyMember;
        }
        let _ = inner.rooms.entry(room.clone()).or_default().insert(id.clone());
        JoinOutcome::Joined
    }

    /// Remove `id` from `room`.
    pub async fn leave(&self, id: &ConnectionId, room: &RoomId) -> LeaveOutcome {
        let mut inner = self.inner.write().await;
        let Some(member) = inner.connections.get_mut(id) else {
            return LeaveOutcome::UnknownConnection;
        };
        if !member.rooms.remove(room) {
            return LeaveOutcome::NotMember;
        }
        inner.drop_from_room(room, id);
        LeaveOutcome::Left
    }

    /// Look up a registered connection.
    pub async fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.inner
            .read()
            .await
            .connections
            .get(id)
            .map(|m| m.connection.clone())
    }

    /// Queue a frame for one connection.
    pub async fn send_to(&self, id: &ConnectionId, frame: Arc<String>) -> Result<(), FanoutError> {
        let connection = self.get(id).await.ok_or_else(|| FanoutError::Connection {
            connection_id: id.clone(),
            reason: "not registered".into(),
        })?;
        connection.send(frame)
    }

    /// Registered connections.
    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Local members of `room`.
    pub async fn room_size(&self, room: &RoomId) -> usize {
        self.inner.read().await.rooms.get(room).map_or(0, BTreeSet::len)
    }

    /// Rooms with at least one local member.
    pub async fn rooms(&self) -> Vec<RoomId> {
        self.inner.read().await.rooms.keys().cloned().collect()
    }

    /// Rooms `id` is a member of.
    pub async fn rooms_of(&self, id: &ConnectionId) -> Vec<RoomId> {
        self.inner
            .read()
            .await
            .connections
            .get(id)
            .map(|m| m.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every `(connection, room)` membership held locally.
    pub async fn memberships(&self) -> Vec<(ConnectionId, RoomId)> {
        let inner = self.inner.read().await;
        inner
            .connections
            .iter()
            .flat_map(|(id, m)| m.rooms.iter().map(move |room| (id.clone(), room.clone())))
            .collect()
    }

    /// Whether draining has closed the registry.
    pub async fn is_closed(&self) -> bool {
        self.inner.read().await.closed
    }

    /// Stop accepting connections, close every attached one and return the
    /// rooms each was in so leaves can be announced.
    pub async fn close_all(&self, force: bool) -> Vec<(ConnectionId, Vec<RoomId>)> {
        let mut inner = self.inner.write().await;
        inner.closed = true;
        inner.rooms.clear();
        let closed: Vec<_> = inner
            .connections
            .drain()
            .map(|(id, member)| {
                member.connection.close(force);
                (id, member.rooms.into_iter().collect())
            })
            .collect();
        debug!(count = closed.len(), force, "closed all local connections");
        closed
    }
}

#[async_trait]
impl LocalDelivery for ConnectionRegistry {
    async fn deliver(&self, frame: Arc<String>, scope: Scope<'_>) -> Result<FanoutReport, FanoutError> {
        let mut report = FanoutReport::default();
        let mut failed = Vec::new();
        {
            let inner = self.inner.read().await;
            if inner.closed {
                return Err(FanoutError::Closed);
            }
            let targets: Vec<&Arc<Connection>> = match scope.room {
                Some(room) => inner
                    .rooms
                    .get(room)
                    .into_iter()
                    .flatten()
                    .filter_map(|id| inner.connections.get(id).map(|m| &m.connection))
                    .collect(),
                None => inner.connections.values().map(|m| &m.connection).collect(),
            };
            for connection in targets {
                if scope.exclude == Some(&connection.id) {
                    continue;
                }
                match connection.send(frame.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(e) => {
                        warn!(conn_id = %connection.id, error = %e, "local delivery failed, closing connection");
                        failed.push(connection.clone());
                    }
                }
            }
        }
        for connection in failed {
            connection.close(true);
            report.failed.push(connection.id.clone());
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_connection(id: &str) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        make_connection_with_capacity(id, 32)
    }

    fn make_connection_with_capacity(id: &str, capacity: usize) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(Connection::new(ConnectionId::from(id), tx)), rx)
    }

    fn text(s: &str) -> Arc<String> {
        Arc::new(s.to_string())
    }

    fn received(rx: &mut mpsc::Receiver<Outbound>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Text(t) = item {
                out.push(t.as_str().to_string());
            }
        }
        out
    }

    #[tokio::test]
    async fn send_to_full_queue_counts_drop() {
        let (conn, _rx) = make_connection_with_capacity("c1", 1);
        assert!(conn.send(text("one")).is_ok());
        let err = conn.send(text("two")).unwrap_err();
        assert!(matches!(err, FanoutError::Connection { .. }));
        assert_eq!(conn.drop_count(), 1);
    }

    #[tokio::test]
    async fn graceful_close_queues_close_frame() {
        let (conn, mut rx) = make_connection("c1");
        conn.close(false);
        assert_eq!(rx.recv().await, Some(Outbound::Close));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn forced_close_cancels_writer() {
        let (conn, _rx) = make_connection("c1");
        let token = conn.closed_token();
        conn.close(true);
        assert!(token.is_cancelled());
        assert!(conn.send(text("late")).is_err());
    }

    #[test]
    fn alive_flag_resets_on_check() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = Connection::new(ConnectionId::from("c1"), tx);
        assert!(conn.check_alive());
        assert!(!conn.check_alive());
        conn.mark_alive();
        assert!(conn.check_alive());
    }

    #[tokio::test]
    async fn register_and_unregister() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = make_connection("c1");
        registry.register(conn).await.unwrap();
        assert_eq!(registry.connection_count().await, 1);

        let room = RoomId::from("lobby");
        assert_eq!(registry.join(&"c1".into(), &room).await, JoinOutcome::Joined);
        let rooms = registry.unregister(&"c1".into()).await.unwrap();
        assert_eq!(rooms, vec![room.clone()]);
        assert_eq!(registry.connection_count().await, 0);
        assert_eq!(registry.room_size(&room).await, 0);
        assert!(registry.unregister(&"c1".into()).await.is_none());
    }

    #[tokio::test]
    async fn join_and_leave_are_idempotent() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = make_connection("c1");
        registry.register(conn).await.unwrap();
        let id = ConnectionId::from("c1");
        let room = RoomId::from("lobby");

        assert_eq!(registry.join(&id, &room).await, JoinOutcome::Joined);
        assert_eq!(registry.join(&id, &room).await, JoinOutcome::AlreadyMember);
        assert_eq!(registry.room_size(&room).await, 1);
        assert_eq!(registry.leave(&id, &room).await, LeaveOutcome::Left);
        assert_eq!(registry.leave(&id, &room).await, LeaveOutcome::NotMember);
        assert!(registry.rooms().await.is_empty());

        let ghost = ConnectionId::from("ghost");
        assert_eq!(registry.join(&ghost, &room).await, JoinOutcome::UnknownConnection);
        assert_eq!(registry.leave(&ghost, &room).await, LeaveOutcome::UnknownConnection);
    }

    #[tokio::test]
    async fn deliver_excludes_origin() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = make_connection("a");
        let (b, mut rx_b) = make_connection("b");
        let (c, mut rx_c) = make_connection("c");
        for conn in [a, b, c] {
            registry.register(conn).await.unwrap();
        }
        let origin = ConnectionId::from("a");
        let report = registry
            .deliver(text("hi"), Scope::excluding(&origin, None))
            .await
            .unwrap();
        assert_eq!(report.delivered, 2);
        assert!(received(&mut rx_a).is_empty());
        assert_eq!(received(&mut rx_b), ["hi"]);
        assert_eq!(received(&mut rx_c), ["hi"]);
    }

    #[tokio::test]
    async fn deliver_scoped_to_room() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = make_connection("a");
        let (b, mut rx_b) = make_connection("b");
        registry.register(a).await.unwrap();
        registry.register(b).await.unwrap();
        let room = RoomId::from("lobby");
        let _ = registry.join(&"a".into(), &room).await;

        let report = registry
            .deliver(
                text("room msg"),
                Scope {
                    room: Some(&room),
                    exclude: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(received(&mut rx_a), ["room msg"]);
        assert!(received(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn failing_connection_is_isolated_and_closed() {
        let registry = ConnectionRegistry::new();
        let (slow, _rx_slow) = make_connection_with_capacity("slow", 1);
        let (fast, mut rx_fast) = make_connection("fast");
        registry.register(slow.clone()).await.unwrap();
        registry.register(fast).await.unwrap();
        slow.send(text("filler")).unwrap();

        let report = registry.deliver(text("x"), Scope::everyone()).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, vec![ConnectionId::from("slow")]);
        assert!(slow.is_closed());
        assert_eq!(received(&mut rx_fast), ["x"]);
    }

    #[tokio::test]
    async fn close_all_rejects_new_work() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = make_connection("a");
        registry.register(a).await.unwrap();
        let _ = registry.join(&"a".into(), &RoomId::from("lobby")).await;

        let closed = registry.close_all(false).await;
        assert_eq!(closed, vec![(ConnectionId::from("a"), vec![RoomId::from("lobby")])]);
        assert_eq!(rx_a.recv().await, Some(Outbound::Close));
        assert!(registry.is_closed().await);

        let (late, _rx) = make_connection("late");
        assert!(matches!(registry.register(late).await, Err(FanoutError::Closed)));
        assert!(matches!(
            registry.deliver(text("x"), Scope::everyone()).await,
            Err(FanoutError::Closed)
        ));
    }

    #[tokio::test]
    async fn memberships_snapshot() {
        let registry = ConnectionRegistry::new();
        let (a, _rx) = make_connection("a");
        registry.register(a).await.unwrap();
        let _ = registry.join(&"a".into(), &RoomId::from("x")).await;
        let _ = registry.join(&"a".into(), &RoomId::from("y")).await;
        let mut all = registry.memberships().await;
        all.sort_by(|l, r| l.1.as_str().cmp(r.1.as_str()));
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].1.as_str(), "x");
        assert_eq!(registry.rooms_of(&"a".into()).await.len(), 2);
    }
}
