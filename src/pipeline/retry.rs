//! Send retries with exponential backoff and jitter.

use crate::Error;
use crate::transport::Transport;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry and pacing policy for one delivery task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total send attempts, including the first.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles for each later one.
    pub base_delay: Duration,
    /// Exclusive upper bound of the random jitter added to every backoff.
    pub max_jitter: Duration,
    /// Pause after a confirmed send, holding the worker slot.
    pub cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_jitter: Duration::from_millis(500),
            cooldown: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Deterministic part of the backoff after failed attempt `attempt` (0-based): `base * 2^attempt`.
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1 << attempt.min(16))
    }

    /// Full backoff after failed attempt `attempt`: exponential part plus `U[0, max_jitter)`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff_for_attempt(attempt)
            .saturating_add(self.jitter())
    }

    fn jitter(&self) -> Duration {
        let bound = u64::try_from(self.max_jitter.as_nanos()).unwrap_or(u64::MAX);
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::thread_rng().gen_range(0..bound))
    }
}

/// What happened to one delivery task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryOutcome {
    /// Whether a send was confirmed.
    pub delivered: bool,
    /// Send attempts made.
    pub attempts: u32,
    /// Backoff sleeps taken between attempts.
    pub backoffs: u32,
    /// The most recent send error, cleared on success.
    pub last_error: Option<String>,
}

/// Sends `text` to `channel`, retrying with backoff per `policy`.
///
/// Never fails: exhaustion is reported through the outcome, since a failed
/// send simply leaves the item eligible for the next cycle.
pub async fn deliver_with_retry(
    transport: &Arc<dyn Transport>,
    channel: &str,
    text: &str,
    policy: &RetryPolicy,
) -> DeliveryOutcome {
    let max_attempts = policy.max_attempts.max(1);
    let mut outcome = DeliveryOutcome::default();

    for attempt in 0..max_attempts {
        outcome.attempts += 1;
        metrics::counter!("feedrelay_send_attempts_total").increment(1);

        match send_blocking(transport, channel, text).await {
            Ok(()) => {
                outcome.delivered = true;
                outcome.last_error = None;
                return outcome;
            },
            Err(e) => {
                if attempt + 1 < max_attempts {
                    let delay = policy.delay_for_attempt(attempt);
                    debug!(
                        channel,
                        attempt = attempt + 1,
                        max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Send failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    outcome.backoffs += 1;
                } else {
                    warn!(channel, attempts = max_attempts, error = %e, "Send failed after all attempts");
                }
                outcome.last_error = Some(e.to_string());
            },
        }
    }

    outcome
}

async fn send_blocking(transport: &Arc<dyn Transport>, channel: &str, text: &str) -> crate::Result<()> {
    let transport = Arc::clone(transport);
    let channel = channel.to_string();
    let text = text.to_string();
    tokio::task::spawn_blocking(move || transport.send(&channel, &text))
        .await
        .unwrap_or_else(|e| Err(Error::operation("send_message", e)))
}
