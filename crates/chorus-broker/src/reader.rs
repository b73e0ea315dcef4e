//! Consumer-group read loop.
//!
//! A [`GroupReader`] yields batches for one consumer in this order:
//!
//! 1. Its own pending backlog (entries delivered before a crash or failure
//!    and never acknowledged), walked with a cursor until exhausted.
//! 2. Live reads of new entries, blocking up to `block` each time. Every
//!    `claim_interval` it first claims entries other consumers left idle for
//!    longer than `visibility_timeout`.
//!
//! Any broker error is logged, followed by a backoff sleep, and the reader
//! restarts from step 1 so nothing delivered but unacknowledged is skipped.
//! A missing group (the broker lost its data) is recreated at the start of
//! the stream first, so producers appending meanwhile are not skipped.

use std::sync::Arc;
use std::time::Duration;

use chorus_core::{BrokerError, DeliveryId, LogRecord};
use futures::Stream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::retry::{Backoff, RetryPolicy};
use crate::{Broker, GroupRead, ReadStart};

/// Static parameters of a reader.
#[derive(Clone, Debug)]
pub struct GroupReaderConfig {
    /// Stream key.
    pub stream: String,
    /// Consumer group read through.
    pub group: String,
    /// This reader's consumer name.
    pub consumer: String,
    /// Max entries per read.
    pub batch_size: usize,
    /// Wait per live read.
    pub block: Duration,
    /// Idle time after which another consumer's entry is claimed.
    pub visibility_timeout: Duration,
    /// Pause between stale-claim sweeps.
    pub claim_interval: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Phase {
    Backlog { after: Option<DeliveryId> },
    Live,
}

enum Step {
    Batch(Vec<LogRecord>),
    /// Live read timed out with nothing new.
    Idle,
    /// Backlog exhausted; switch to live reads without yielding.
    Advance,
}

/// Lazy sequence of batches for one consumer.
pub struct GroupReader {
    broker: Arc<dyn Broker>,
    config: GroupReaderConfig,
    backoff: Backoff,
    phase: Phase,
    last_claim: Option<Instant>,
}

impl GroupReader {
    /// Reader starting with this consumer's pending backlog.
    pub fn new(broker: Arc<dyn Broker>, config: GroupReaderConfig, retry: RetryPolicy) -> Self {
        Self {
            broker,
            config,
            backoff: Backoff::new(retry),
            phase: Phase::Backlog { after: None },
            last_claim: None,
        }
    }

    /// Parameters this reader was built with.
    pub fn config(&self) -> &GroupReaderConfig {
        &self.config
    }

    /// Whether the reader is still draining its pending backlog.
    pub fn in_backlog(&self) -> bool {
        matches!(self.phase, Phase::Backlog { .. })
    }

    /// Next batch, which may be empty after an idle live read. Returns `None`
    /// once `cancel` fires; a batch already in hand is always returned first.
    pub async fn next_batch(&mut self, cancel: &CancellationToken) -> Option<Vec<LogRecord>> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            let step = tokio::select! {
                step = self.step() => step,
                () = cancel.cancelled() => return None,
            };
            match step {
                Ok(Step::Batch(batch)) => {
                    self.backoff.reset();
                    return Some(batch);
                }
                Ok(Step::Idle) => {
                    self.backoff.reset();
                    return Some(Vec::new());
                }
                Ok(Step::Advance) => {}
                Err(BrokerError::NoGroup(reason)) => {
                    self.phase = Phase::Backlog { after: None };
                    warn!(
                        stream = %self.config.stream,
                        group = %self.config.group,
                        reason = %reason,
                        "consumer group missing, restoring"
                    );
                    let restored = tokio::select! {
                        restored = self.broker.restore_group(&self.config.stream, &self.config.group) => restored,
                        () = cancel.cancelled() => return None,
                    };
                    match restored {
                        Ok(status) => info!(group = %self.config.group, ?status, "consumer group restored"),
                        Err(e) => {
                            if !self.pause(&e, cancel).await {
                                return None;
                            }
                        }
                    }
                }
                Err(e) => {
                    self.phase = Phase::Backlog { after: None };
                    if !self.pause(&e, cancel).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Log a failed step and back off. Returns `false` when cancelled.
    async fn pause(&mut self, e: &BrokerError, cancel: &CancellationToken) -> bool {
        let delay = self.backoff.next_delay();
        warn!(
            stream = %self.config.stream,
            group = %self.config.group,
            consumer = %self.config.consumer,
            error = %e,
            error_kind = e.error_kind(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "group read failed, restarting from pending backlog"
        );
        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            () = cancel.cancelled() => false,
        }
    }

    /// Adapt the reader into a stream of batches ending at cancellation.
    pub fn into_stream(mut self, cancel: CancellationToken) -> impl Stream<Item = Vec<LogRecord>> + Send {
        async_stream::stream! {
            while let Some(batch) = self.next_batch(&cancel).await {
                yield batch;
            }
        }
    }

    async fn step(&mut self) -> Result<Step, BrokerError> {
        match self.phase.clone() {
            Phase::Backlog { after } => {
                let read = GroupRead {
                    stream: &self.config.stream,
                    group: &self.config.group,
                    consumer: &self.config.consumer,
                    start: ReadStart::Pending { after },
                    count: self.config.batch_size,
                    block: Duration::ZERO,
                };
                let batch = self.broker.read_group(&read).await?;
                match batch.last() {
                    Some(last) => {
                        debug!(count = batch.len(), "replaying pending backlog");
                        self.phase = Phase::Backlog {
                            after: Some(last.id.clone()),
                        };
                        Ok(Step::Batch(batch))
                    }
                    None => {
                        self.phase = Phase::Live;
                        Ok(Step::Advance)
                    }
                }
            }
            Phase::Live => {
                if self.claim_due() {
                    self.last_claim = Some(Instant::now());
                    let claimed = self
                        .broker
                        .claim_stale(
                            &self.config.stream,
                            &self.config.group,
                            &self.config.consumer,
                            self.config.visibility_timeout,
                            self.config.batch_size,
                        )
                        .await?;
                    if !claimed.is_empty() {
                        debug!(count = claimed.len(), "claimed stale entries");
                        return Ok(Step::Batch(claimed));
                    }
                }
                let read = GroupRead {
                    stream: &self.config.stream,
                    group: &self.config.group,
                    consumer: &self.config.consumer,
                    start: ReadStart::New,
                    count: self.config.batch_size,
                    block: self.config.block,
                };
                let batch = self.broker.read_group(&read).await?;
                if batch.is_empty() {
                    Ok(Step::Idle)
                } else {
                    Ok(Step::Batch(batch))
                }
            }
        }
    }

    fn claim_due(&self) -> bool {
        self.last_claim
            .map_or(true, |at| at.elapsed() >= self.config.claim_interval)
    }
}
