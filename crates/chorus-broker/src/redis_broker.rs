//! Redis-backed broker.
//!
//! Topics map onto `PUBLISH`/`SUBSCRIBE`, logs onto streams with consumer
//! groups. Commands share one multiplexed [`ConnectionManager`]; blocking
//! `XREADGROUP` calls get their own so they never stall publishes. Each
//! subscription runs a pump task that re-subscribes with backoff after the
//! connection drops and emits [`SubscriptionItem::Resubscribed`] when it does.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chorus_core::{BrokerError, DeliveryId, Fields, LogRecord};
use chorus_settings::BrokerSettings;
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use redis::{Client, Cmd, FromRedisValue, RedisError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::retry::{Backoff, RetryPolicy};
use crate::{Broker, GroupRead, GroupStatus, ReadStart, Subscription, SubscriptionItem};

/// Failure of a single command, before classification.
#[derive(Debug)]
enum CommandFailure {
    Timeout(Duration),
    Redis(RedisError),
}

impl From<CommandFailure> for BrokerError {
    fn from(failure: CommandFailure) -> Self {
        match failure {
            CommandFailure::Timeout(after) => BrokerError::Timeout(after),
            CommandFailure::Redis(err) => classify(&err),
        }
    }
}

/// Map a Redis error onto the broker taxonomy.
fn classify(err: &RedisError) -> BrokerError {
    if err.code() == Some("NOGROUP") {
        BrokerError::NoGroup(err.to_string())
    } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        BrokerError::Unavailable(err.to_string())
    } else {
        BrokerError::Protocol(err.to_string())
    }
}

fn decode_entry(entry: StreamId) -> LogRecord {
    let mut fields = Fields::new();
    for (key, value) in &entry.map {
        match redis::from_redis_value::<String>(value) {
            Ok(text) => {
                let _ = fields.insert(key.clone(), text);
            }
            Err(e) => debug!(id = %entry.id, field = %key, error = %e, "skipping non-string stream field"),
        }
    }
    LogRecord::new(DeliveryId::from_raw(entry.id), fields)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Broker client over a Redis server.
pub struct RedisBroker {
    client: Client,
    commands: ConnectionManager,
    reader: ConnectionManager,
    connect_timeout: Duration,
    op_timeout: Duration,
    retry: RetryPolicy,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisBroker {
    /// Open the connections and verify the server answers `PING`.
    pub async fn connect(settings: &BrokerSettings) -> Result<Self, BrokerError> {
        let client = Client::open(settings.url.as_str()).map_err(|e| classify(&e))?;
        let connect_timeout = settings.connect_timeout();

        let open = async {
            let commands = ConnectionManager::new(client.clone()).await?;
            let reader = ConnectionManager::new(client.clone()).await?;
            Ok::<_, RedisError>((commands, reader))
        };
        let (commands, reader) = tokio::time::timeout(connect_timeout, open)
            .await
            .map_err(|_| BrokerError::Timeout(connect_timeout))?
            .map_err(|e| classify(&e))?;

        let broker = Self {
            client,
            commands,
            reader,
            connect_timeout,
            op_timeout: settings.op_timeout(),
            retry: RetryPolicy::from_settings(&settings.retry),
            shutdown: CancellationToken::new(),
        };
        broker.ping().await?;
        info!("connected to redis broker");
        Ok(broker)
    }

    async fn run<T: FromRedisValue>(
        connection: &ConnectionManager,
        cmd: &Cmd,
        limit: Duration,
    ) -> Result<T, CommandFailure> {
        let mut connection = connection.clone();
        let result: redis::RedisResult<T> = match tokio::time::timeout(limit, cmd.query_async(&mut connection)).await {
            Ok(result) => result,
            Err(_) => return Err(CommandFailure::Timeout(limit)),
        };
        result.map_err(CommandFailure::Redis)
    }

    async fn command<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T, BrokerError> {
        Ok(Self::run(&self.commands, cmd, self.op_timeout).await?)
    }

    /// `XGROUP CREATE … MKSTREAM` at `start`; BUSYGROUP means it exists.
    async fn create_group(&self, stream: &str, group: &str, start: &str) -> Result<GroupStatus, BrokerError> {
        let mut cmd = redis::cmd("XGROUP");
        let _ = cmd.arg("CREATE").arg(stream).arg(group).arg(start).arg("MKSTREAM");
        match Self::run::<()>(&self.commands, &cmd, self.op_timeout).await {
            Ok(()) => Ok(GroupStatus::Created),
            Err(CommandFailure::Redis(e)) if e.code() == Some("BUSYGROUP") => {
                let existing = BrokerError::GroupAlreadyExists {
                    stream: stream.to_string(),
                    group: group.to_string(),
                };
                debug!(reason = %existing, "consumer group kept");
                Ok(GroupStatus::AlreadyExists)
            }
            Err(failure) => Err(failure.into()),
        }
    }
}

async fn open_pubsub(client: &Client, topic: &str, limit: Duration) -> Result<PubSub, BrokerError> {
    let mut pubsub = tokio::time::timeout(limit, client.get_async_pubsub())
        .await
        .map_err(|_| BrokerError::Timeout(limit))?
        .map_err(|e| classify(&e))?;
    tokio::time::timeout(limit, pubsub.subscribe(topic))
        .await
        .map_err(|_| BrokerError::Timeout(limit))?
        .map_err(|e| classify(&e))?;
    Ok(pubsub)
}

/// Forward messages from `pubsub` into `tx` until the receiver goes away or
/// `cancel` fires, re-subscribing after every connection loss.
async fn pump(
    client: Client,
    topic: String,
    pubsub: PubSub,
    tx: mpsc::UnboundedSender<SubscriptionItem>,
    cancel: CancellationToken,
    retry: RetryPolicy,
    connect_timeout: Duration,
) {
    let mut current = Some(pubsub);
    let mut backoff = Backoff::new(retry);

    loop {
        let mut pubsub = if let Some(pubsub) = current.take() {
            pubsub
        } else {
            match open_pubsub(&client, &topic, connect_timeout).await {
                Ok(pubsub) => {
                    backoff.reset();
                    info!(topic = %topic, "redis subscription restored");
                    if tx.send(SubscriptionItem::Resubscribed).is_err() {
                        return;
                    }
                    pubsub
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(topic = %topic, error = %e, delay_ms = millis(delay), "redis resubscribe failed");
                    tokio::select! {
                        () = tokio::time::sleep(delay) => continue,
                        () = cancel.cancelled() => return,
                    }
                }
            }
        };

        let mut messages = pubsub.on_message();
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                msg = messages.next() => match msg {
                    Some(msg) => {
                        let payload = Bytes::copy_from_slice(msg.get_payload_bytes());
                        if tx.send(SubscriptionItem::Message(payload)).is_err() {
                            return;
                        }
                    }
                    None => {
                        warn!(topic = %topic, "redis subscription connection lost");
                        break;
                    }
                },
            }
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        let _pong: String = self.command(&redis::cmd("PING")).await?;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        let mut cmd = redis::cmd("PUBLISH");
        let _ = cmd.arg(topic).arg(payload.as_ref());
        let receivers: i64 = self.command(&cmd).await?;
        debug!(topic, receivers, "published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
        let pubsub = open_pubsub(&self.client, topic, self.connect_timeout).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tokio::spawn(pump(
            self.client.clone(),
            topic.to_string(),
            pubsub,
            tx,
            self.shutdown.child_token(),
            self.retry.clone(),
            self.connect_timeout,
        ));
        debug!(topic, "redis subscription opened");
        Ok(Subscription::new(topic, rx))
    }

    async fn append(&self, stream: &str, fields: &Fields) -> Result<DeliveryId, BrokerError> {
        let mut cmd = redis::cmd("XADD");
        let _ = cmd.arg(stream).arg("*");
        for (key, value) in fields {
            let _ = cmd.arg(key).arg(value);
        }
        let id: String = self.command(&cmd).await?;
        Ok(DeliveryId::from_raw(id))
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<GroupStatus, BrokerError> {
        self.create_group(stream, group, "$").await
    }

    async fn restore_group(&self, stream: &str, group: &str) -> Result<GroupStatus, BrokerError> {
        self.create_group(stream, group, "0").await
    }

    async fn read_group(&self, read: &GroupRead<'_>) -> Result<Vec<LogRecord>, BrokerError> {
        let mut cmd = redis::cmd("XREADGROUP");
        let _ = cmd
            .arg("GROUP")
            .arg(read.group)
            .arg(read.consumer)
            .arg("COUNT")
            .arg(read.count);
        let (start, limit) = match &read.start {
            ReadStart::Pending { after } => (
                after.as_ref().map_or_else(|| "0".to_string(), ToString::to_string),
                self.op_timeout,
            ),
            ReadStart::New => {
                let _ = cmd.arg("BLOCK").arg(millis(read.block));
                (">".to_string(), read.block + self.op_timeout)
            }
        };
        let _ = cmd.arg("STREAMS").arg(read.stream).arg(start);

        let reply: Option<StreamReadReply> = Self::run(&self.reader, &cmd, limit).await?;
        Ok(reply
            .into_iter()
            .flat_map(|reply| reply.keys)
            .flat_map(|key| key.ids)
            .map(decode_entry)
            .collect())
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<LogRecord>, BrokerError> {
        let mut pending = redis::cmd("XPENDING");
        let _ = pending
            .arg(stream)
            .arg(group)
            .arg("IDLE")
            .arg(millis(min_idle))
            .arg("-")
            .arg("+")
            .arg(count);
        let stale: StreamPendingCountReply = self.command(&pending).await?;
        if stale.ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut claim = redis::cmd("XCLAIM");
        let _ = claim.arg(stream).arg(group).arg(consumer).arg(millis(min_idle));
        for entry in &stale.ids {
            let _ = claim.arg(&entry.id);
        }
        let claimed: StreamClaimReply = self.command(&claim).await?;
        Ok(claimed.ids.into_iter().map(decode_entry).collect())
    }

    async fn ack(&self, stream: &str, group: &str, id: &DeliveryId) -> Result<(), BrokerError> {
        let mut cmd = redis::cmd("XACK");
        let _ = cmd.arg(stream).arg(group).arg(id.as_str());
        let acked: i64 = self.command(&cmd).await?;
        if acked == 0 {
            return Err(BrokerError::AckRejected { id: id.clone() });
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
        debug!("redis broker shut down");
    }
}
