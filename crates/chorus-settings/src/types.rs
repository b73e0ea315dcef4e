//! Settings schema.
//!
//! Every section implements `Default`, so a layer only has to name the keys
//! it changes.

use std::time::Duration;

use chorus_core::{NodeId, RoomId};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChorusSettings {
    /// Identity of this process in the cluster.
    pub node: NodeSettings,
    /// Listener and per-connection limits.
    pub server: ServerSettings,
    /// Broker endpoint, channels and retry policy.
    pub broker: BrokerSettings,
    /// Pub/sub or log delivery.
    pub delivery: DeliverySettings,
    /// Peer heartbeats for remote room membership.
    pub membership: MembershipSettings,
    /// Log output.
    pub telemetry: TelemetrySettings,
}

impl ChorusSettings {
    /// Check cross-field constraints. Called once by the loader; callers that
    /// build settings by hand should call it too.
    pub fn validate(&self) -> Result<()> {
        self.broker.validate()?;
        self.delivery.validate(&self.broker)?;
        if self.delivery.mode == DeliveryMode::Log
            && self.delivery.log.group_scope == GroupScope::PerNode
            && !self.node.has_stable_name()
        {
            return Err(SettingsError::invalid(
                "node.name",
                "required with delivery.log.group_scope = per_node, or a restart would orphan the group",
            ));
        }
        self.membership.validate()?;
        if self.server.max_send_queue == 0 {
            return Err(SettingsError::invalid("server.max_send_queue", "must be at least 1"));
        }
        if self.server.heartbeat_interval_secs == 0 {
            return Err(SettingsError::invalid(
                "server.heartbeat_interval_secs",
                "must be at least 1",
            ));
        }
        if let Some(room) = &self.server.default_room {
            if room.as_str().trim().is_empty() {
                return Err(SettingsError::invalid("server.default_room", "must not be blank"));
            }
        }
        Ok(())
    }
}

/// `node` section.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Stable node name. Defaults to `<hostname>-<pid>`.
    pub name: Option<String>,
}

impl NodeSettings {
    /// Configured name, or `<hostname>-<pid>` when unset.
    pub fn node_id(&self) -> NodeId {
        match &self.name {
            Some(name) if !name.is_empty() => NodeId::from_raw(name.clone()),
            _ => NodeId::from_process(),
        }
    }

    /// Whether the id survives a restart.
    pub fn has_stable_name(&self) -> bool {
        self.name.as_deref().is_some_and(|name| !name.trim().is_empty())
    }
}

/// `server` section.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// `0` picks a free port.
    pub port: u16,
    /// Outbound frames buffered per connection before writes start failing.
    pub max_send_queue: usize,
    /// Ping period; a client silent for two periods is dropped.
    pub heartbeat_interval_secs: u64,
    /// Room every new connection joins automatically.
    pub default_room: Option<RoomId>,
    /// Upper bound for the whole drain sequence.
    pub drain_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            default_room: None,
            drain_timeout_ms: 10_000,
        }
    }
}

impl ServerSettings {
    /// `heartbeat_interval_secs` as a duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// `drain_timeout_ms` as a duration.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Broker schemes the client knows how to reach.
pub const SUPPORTED_SCHEMES: &[&str] = &["redis://", "rediss://", "memory://"];

/// `broker` section.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// `redis://host:port/db`, `rediss://…`, or `memory://` for a
    /// single-process in-memory broker.
    pub url: String,
    /// Bound on the initial connection.
    pub connect_timeout_ms: u64,
    /// Bound on every non-blocking broker command.
    pub op_timeout_ms: u64,
    /// Pub/sub topic carrying relayed events.
    pub event_channel: String,
    /// Pub/sub topic carrying control-plane messages.
    pub control_channel: String,
    /// Backoff for transient failures.
    pub retry: RetrySettings,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".into(),
            connect_timeout_ms: 5_000,
            op_timeout_ms: 10_000,
            event_channel: "chorus:events".into(),
            control_channel: "chorus:control".into(),
            retry: RetrySettings::default(),
        }
    }
}

impl BrokerSettings {
    /// `connect_timeout_ms` as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `op_timeout_ms` as a duration.
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(SettingsError::invalid("broker.url", "must not be empty"));
        }
        if !SUPPORTED_SCHEMES.iter().any(|s| self.url.starts_with(s)) {
            return Err(SettingsError::invalid(
                "broker.url",
                format!("unsupported scheme in {:?}, expected one of {SUPPORTED_SCHEMES:?}", self.url),
            ));
        }
        if self.event_channel.is_empty() || self.control_channel.is_empty() {
            return Err(SettingsError::invalid("broker.*_channel", "must not be empty"));
        }
        if self.event_channel == self.control_channel {
            return Err(SettingsError::invalid(
                "broker.control_channel",
                "must differ from broker.event_channel",
            ));
        }
        if self.op_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(SettingsError::invalid("broker.*_timeout_ms", "must be positive"));
        }
        self.retry.validate()
    }
}

/// Exponential backoff for transient broker failures.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Attempts after the first for a single publish.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Cap on any single delay.
    pub max_delay_ms: u64,
    /// Relative jitter, `0.0..=1.0`.
    pub jitter_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            jitter_factor: 0.2,
        }
    }
}

impl RetrySettings {
    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(SettingsError::invalid("broker.retry.jitter_factor", "must be within 0.0..=1.0"));
        }
        if self.base_delay_ms == 0 || self.max_delay_ms < self.base_delay_ms {
            return Err(SettingsError::invalid(
                "broker.retry",
                "base_delay_ms must be positive and not above max_delay_ms",
            ));
        }
        Ok(())
    }
}

/// How relayed events cross process boundaries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Fire-and-forget topic. Events published while this process is cut off
    /// from the broker are lost to it.
    #[default]
    #[serde(rename = "pubsub")]
    PubSub,
    /// Durable log read through a consumer group, acknowledged after local
    /// fan-out. At-least-once.
    #[serde(rename = "log")]
    Log,
}

impl std::str::FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pubsub" => Ok(Self::PubSub),
            "log" => Ok(Self::Log),
            other => Err(format!("unknown delivery mode {other:?} (expected pubsub or log)")),
        }
    }
}

/// What to do when a pub/sub subscription comes back after a broker outage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
    /// Log the gap only.
    #[default]
    Ignore,
    /// Also send a `gap` frame to every local connection.
    NotifyClients,
}

/// Who shares a consumer group on the log stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupScope {
    /// One group per node (`<group_id>:<node>`); every process reads and fans
    /// out every entry. Requires a stable `node.name`.
    #[default]
    PerNode,
    /// One group for the whole cluster. Each entry is read by one live
    /// process, which re-broadcasts it on the event channel so every process
    /// fans it out.
    Shared,
}

/// `delivery` section.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    /// Pub/sub or log.
    pub mode: DeliveryMode,
    /// Reaction to a restored pub/sub subscription.
    pub gap_policy: GapPolicy,
    /// Log mode parameters; ignored in pub/sub mode.
    pub log: LogSettings,
}

impl DeliverySettings {
    fn validate(&self, broker: &BrokerSettings) -> Result<()> {
        if self.mode == DeliveryMode::Log {
            self.log.validate(broker)?;
        }
        Ok(())
    }
}

/// `delivery.log` section.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Stream every process appends to.
    pub stream_key: String,
    /// Consumer group name, or its prefix with per-node groups.
    pub group_id: String,
    /// Shared or per-node groups.
    pub group_scope: GroupScope,
    /// Max entries per blocking read.
    pub batch_size: usize,
    /// How long one blocking read waits for new entries.
    pub block_ms: u64,
    /// Unacknowledged entries idle this long are claimed for redelivery.
    pub visibility_timeout_ms: u64,
    /// How often the reader sweeps for stale pending entries.
    pub claim_interval_ms: u64,
    /// Acknowledged delivery ids remembered for duplicate suppression.
    pub dedup_window: usize,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            stream_key: "chorus:stream".into(),
            group_id: "chorus".into(),
            group_scope: GroupScope::PerNode,
            batch_size: 10,
            block_ms: 2_000,
            visibility_timeout_ms: 30_000,
            claim_interval_ms: 5_000,
            dedup_window: 4_096,
        }
    }
}

impl LogSettings {
    /// `block_ms` as a duration.
    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    /// `visibility_timeout_ms` as a duration.
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    /// `claim_interval_ms` as a duration.
    pub fn claim_interval(&self) -> Duration {
        Duration::from_millis(self.claim_interval_ms)
    }

    /// Consumer group this node reads through.
    pub fn group_for(&self, node: &NodeId) -> String {
        match self.group_scope {
            GroupScope::Shared => self.group_id.clone(),
            GroupScope::PerNode => format!("{}:{node}", self.group_id),
        }
    }

    fn validate(&self, broker: &BrokerSettings) -> Result<()> {
        if self.stream_key.is_empty() {
            return Err(SettingsError::invalid("delivery.log.stream_key", "must not be empty"));
        }
        if self.group_id.is_empty() {
            return Err(SettingsError::invalid("delivery.log.group_id", "must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(SettingsError::invalid("delivery.log.batch_size", "must be at least 1"));
        }
        if self.block_ms == 0 {
            return Err(SettingsError::invalid("delivery.log.block_ms", "must be positive"));
        }
        if self.block_ms >= broker.op_timeout_ms {
            return Err(SettingsError::invalid(
                "delivery.log.block_ms",
                "must be below broker.op_timeout_ms",
            ));
        }
        if self.visibility_timeout_ms == 0 || self.claim_interval_ms == 0 {
            return Err(SettingsError::invalid(
                "delivery.log.visibility_timeout_ms",
                "visibility timeout and claim interval must be positive",
            ));
        }
        Ok(())
    }
}

/// Peer liveness for remote membership bookkeeping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipSettings {
    /// Period of this node's heartbeat.
    pub heartbeat_interval_ms: u64,
    /// Remote members of a peer unheard of for this long are dropped.
    pub peer_ttl_ms: u64,
}

impl Default for MembershipSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            peer_ttl_ms: 30_000,
        }
    }
}

impl MembershipSettings {
    /// `heartbeat_interval_ms` as a duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// `peer_ttl_ms` as a duration.
    pub fn peer_ttl(&self) -> Duration {
        Duration::from_millis(self.peer_ttl_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(SettingsError::invalid(
                "membership.heartbeat_interval_ms",
                "must be positive",
            ));
        }
        if self.peer_ttl_ms <= self.heartbeat_interval_ms {
            return Err(SettingsError::invalid(
                "membership.peer_ttl_ms",
                "must exceed membership.heartbeat_interval_ms",
            ));
        }
        Ok(())
    }
}

/// `telemetry` section.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Default filter directive; `RUST_LOG` wins when set.
    pub level: String,
    /// JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: true,
        }
    }
}
