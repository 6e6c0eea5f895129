//! Retrying delivery on top of a [`Transport`].
//!
//! Transient failures (network errors, timeouts, server-side rate limits)
//! are retried with exponential backoff and jitter.  Permanent failures are
//! returned immediately.  Once the attempt budget is spent the caller gets
//! [`ChannelError::Exhausted`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use relay_core::config::DeliveryConfig;
use relay_core::UserId;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::transport::{MessageHandle, Transport};

/// Upper bound for a single backoff pause.
const BACKOFF_MAX: Duration = Duration::from_secs(30);
/// Jitter fraction applied to each delay (+0..10 %).
const JITTER_FRACTION: f64 = 0.10;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &DeliveryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
        }
    }

    /// Pause after the `attempt`-th failure (1-based): `base * 2^(attempt-1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(BACKOFF_MAX)
    }

    /// Run `op` until it succeeds, fails permanently, or runs out of attempts.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ChannelError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChannelError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= self.max_attempts => {
                    warn!(op = what, attempts = attempt, error = %e, "delivery attempts exhausted");
                    return Err(ChannelError::Exhausted {
                        attempts: attempt,
                        last: e.to_string(),
                    });
                }
                Err(e) => {
                    let delay = match e.retry_after() {
                        Some(wait) => wait,
                        None => {
                            let base = self.backoff(attempt);
                            base + jitter(base)
                        }
                    };
                    warn!(
                        op = what,
                        attempt,
                        max = self.max_attempts,
                        error = %e,
                        retry_after_ms = delay.as_millis() as u64,
                        "delivery failed, retrying with backoff"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Return a jitter offset of up to `JITTER_FRACTION * base`.
///
/// Derived from the wall clock's sub-second part to avoid a rand dependency.
fn jitter(base: Duration) -> Duration {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);

    let max_jitter = (base.as_millis() as f64 * JITTER_FRACTION) as u64;
    if max_jitter == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(nanos as u64 % max_jitter)
}

/// A transport paired with the retry policy used for every call through it.
#[derive(Clone)]
pub struct Delivery {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl Delivery {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn send(&self, user: UserId, text: &str) -> Result<MessageHandle, ChannelError> {
        self.policy
            .run("send", || self.transport.send(user, text))
            .await
    }

    /// Edit with retry.  An unchanged text counts as success.
    pub async fn edit(&self, handle: &MessageHandle, text: &str) -> Result<(), ChannelError> {
        match self
            .policy
            .run("edit", || self.transport.edit(handle, text))
            .await
        {
            Err(ChannelError::NotModified) => Ok(()),
            other => other,
        }
    }

    /// Send and log instead of failing; for notices the user can live without.
    pub async fn notify(&self, user: UserId, text: &str) -> Option<MessageHandle> {
        match self.send(user, text).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(user_id = %user, error = %e, "failed to deliver notice");
                None
            }
        }
    }

    pub async fn typing(&self, user: UserId) {
        if let Err(e) = self.transport.typing(user).await {
            debug!(user_id = %user, error = %e, "typing indicator failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: attempts,
            base_delay: Duration::from_millis(1000),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy(3);
        assert_eq!(p.backoff(1), Duration::from_secs(1));
        assert_eq!(p.backoff(2), Duration::from_secs(2));
        assert_eq!(p.backoff(3), Duration::from_secs(4));
        assert_eq!(p.backoff(40), BACKOFF_MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_next_send(ChannelError::Network("reset".to_string()));
        transport.fail_next_send(ChannelError::RetryAfter { secs: 5 });
        let delivery = Delivery::new(transport.clone(), policy(3));

        let handle = delivery.send(UserId(1), "hello").await.unwrap();
        assert_eq!(handle.user, UserId(1));
        assert_eq!(transport.texts_for(UserId(1)), vec!["hello".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_is_reported() {
        let transport = Arc::new(MemoryTransport::new());
        for _ in 0..3 {
            transport.fail_next_send(ChannelError::Timeout { ms: 10 });
        }
        let delivery = Delivery::new(transport.clone(), policy(3));

        let err = delivery.send(UserId(1), "hello").await.unwrap_err();
        assert!(matches!(err, ChannelError::Exhausted { attempts: 3, .. }));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_next_send(ChannelError::Rejected("chat not found".to_string()));
        let delivery = Delivery::new(transport.clone(), policy(3));

        let err = delivery.send(UserId(1), "hello").await.unwrap_err();
        assert!(matches!(err, ChannelError::Rejected(_)));
        // The scripted failure was consumed by the single attempt; the next
        // send goes through.
        delivery.send(UserId(1), "again").await.unwrap();
        assert_eq!(transport.texts_for(UserId(1)), vec!["again".to_string()]);
    }

    #[tokio::test]
    async fn unchanged_edit_is_success() {
        let transport = Arc::new(MemoryTransport::new());
        let delivery = Delivery::new(transport.clone(), policy(3));
        let handle = delivery.send(UserId(1), "status").await.unwrap();

        transport.fail_next_edit(ChannelError::NotModified);
        delivery.edit(&handle, "status").await.unwrap();

        delivery.edit(&handle, "status 2").await.unwrap();
        assert_eq!(transport.current_text(&handle).as_deref(), Some("status 2"));
    }
}
