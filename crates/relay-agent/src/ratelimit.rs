//! Per-user token bucket.
//!
//! Buckets start full and refill continuously.  Each admitted message costs
//! one token.  The check never suspends; the caller decides what to tell a
//! denied user.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use relay_core::config::RateLimitConfig;
use relay_core::UserId;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct RateBucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateBucket {
    fn full(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, capacity: f64, rate: f64) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }
}

pub struct RateLimiter {
    buckets: Mutex<HashMap<UserId, RateBucket>>,
    capacity: f64,
    refill_per_sec: f64,
    enabled: AtomicBool,
}

impl RateLimiter {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            capacity,
            refill_per_sec,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn from_config(cfg: &RateLimitConfig) -> Self {
        let limiter = Self::new(cfg.capacity, cfg.refill_per_sec);
        limiter.set_enabled(cfg.enabled);
        limiter
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Take one token for `user`.  Returns false when the bucket is empty.
    pub fn try_consume(&self, user: UserId) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let mut buckets = self.lock();
        let bucket = buckets
            .entry(user)
            .or_insert_with(|| RateBucket::full(self.capacity));
        bucket.refill(self.capacity, self.refill_per_sec);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            debug!(user_id = %user, tokens = bucket.tokens, "rate limit hit");
            false
        }
    }

    /// Time until `user` has one whole token again.  Zero when admitted now.
    pub fn retry_after(&self, user: UserId) -> Duration {
        if !self.is_enabled() {
            return Duration::ZERO;
        }
        let mut buckets = self.lock();
        let Some(bucket) = buckets.get_mut(&user) else {
            return Duration::ZERO;
        };
        bucket.refill(self.capacity, self.refill_per_sec);
        if bucket.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - bucket.tokens) / self.refill_per_sec)
        }
    }

    /// Whole tokens left for `user`.
    pub fn remaining(&self, user: UserId) -> u32 {
        let mut buckets = self.lock();
        match buckets.get_mut(&user) {
            Some(bucket) => {
                bucket.refill(self.capacity, self.refill_per_sec);
                bucket.tokens.floor() as u32
            }
            None => self.capacity.floor() as u32,
        }
    }

    /// Give `user` a full bucket.
    pub fn reset(&self, user: UserId) {
        self.lock().remove(&user);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, RateBucket>> {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner())
    }
}
