//! Exponential backoff with jitter for transient broker failures.

use std::future::Future;
use std::time::Duration;

use chorus_core::BrokerError;
use chorus_settings::RetrySettings;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Retry schedule for one class of broker operation.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Fraction of the delay added or removed at random.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    /// Build from the `broker.retry` settings table.
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            jitter_factor: settings.jitter_factor,
        }
    }

    /// Delay before retry number `attempt` (zero-based): `base * 2^attempt`,
    /// capped at `max_delay`, then spread by `± jitter_factor`.
    pub fn delay(&self, attempt: u32) -> Duration {
        #[allow(clippy::cast_precision_loss)]
        let base_ms = self.base_delay.as_millis() as f64;
        #[allow(clippy::cast_precision_loss)]
        let max_ms = self.max_delay.as_millis() as f64;
        let exp = base_ms * 2.0_f64.powi(i32::try_from(attempt.min(30)).unwrap_or(30));
        let capped = exp.min(max_ms);

        let jitter_range = capped * self.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let final_ms = (capped + jitter).max(1.0) as u64;
        Duration::from_millis(final_ms)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, runs out
    /// of retries, or `cancel` fires during a backoff sleep.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, BrokerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() || attempt >= self.max_retries => return Err(e),
                Err(e) => {
                    let delay = self.delay(attempt);
                    attempt += 1;
                    warn!(
                        operation,
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "retrying broker operation"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => return Err(BrokerError::Cancelled),
                    }
                }
            }
        }
    }
}

/// Stateful backoff for long-running loops: grows on each failure, resets on
/// success, never gives up.
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    /// Start at attempt zero.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay for the current attempt, then advance.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Back to the base delay after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Failed attempts since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter(base_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn exponential_backoff() {
        let policy = no_jitter(100, 30_000);
        assert_eq!(policy.delay(0).as_millis(), 100);
        assert_eq!(policy.delay(1).as_millis(), 200);
        assert_eq!(policy.delay(2).as_millis(), 400);
    }

    #[test]
    fn capped_at_max() {
        let policy = no_jitter(1_000, 5_000);
        assert_eq!(policy.delay(10).as_millis(), 5_000);
        assert_eq!(policy.delay(u32::MAX).as_millis(), 5_000);
    }

    #[test]
    fn jitter_stays_in_range() {
        let policy = RetryPolicy {
            jitter_factor: 0.5,
            ..no_jitter(100, 10_000)
        };
        for _ in 0..50 {
            let ms = policy.delay(0).as_millis();
            assert!((50..=150).contains(&ms), "delay {ms} out of range");
        }
    }

    #[test]
    fn backoff_grows_and_resets() {
        let mut backoff = Backoff::new(no_jitter(10, 1_000));
        assert_eq!(backoff.next_delay().as_millis(), 10);
        assert_eq!(backoff.next_delay().as_millis(), 20);
        assert_eq!(backoff.attempt(), 2);
        backoff.reset();
        assert_eq!(backoff.next_delay().as_millis(), 10);
    }

    #[tokio::test]
    async fn run_retries_transient_errors() {
        let calls = AtomicU32::new(0);
        let policy = no_jitter(1, 5);
        let result = policy
            .run("publish", &CancellationToken::new(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(BrokerError::Unavailable("down".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let policy = no_jitter(1, 5);
        let result: Result<(), _> = policy
            .run("publish", &CancellationToken::new(), || async {
                let _ = calls.fetch_add(1, Ordering::SeqCst);
                Err(BrokerError::Unavailable("down".into()))
            })
            .await;
        assert!(matches!(result, Err(BrokerError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn run_does_not_retry_protocol_errors() {
        let calls = AtomicU32::new(0);
        let policy = no_jitter(1, 5);
        let result: Result<(), _> = policy
            .run("ack", &CancellationToken::new(), || async {
                let _ = calls.fetch_add(1, Ordering::SeqCst);
                Err(BrokerError::Protocol("WRONGTYPE".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_stops_when_cancelled() {
        let policy = no_jitter(60_000, 60_000);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> = policy
            .run("publish", &cancel, || async { Err(BrokerError::Unavailable("down".into())) })
            .await;
        assert!(matches!(result, Err(BrokerError::Cancelled)));
    }
}
