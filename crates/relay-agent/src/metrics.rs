//! Process-wide request counters.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use relay_safety::RiskTier;
use serde::Serialize;
use tokio::time::Instant;

/// Latency samples kept for average / p95.
const LATENCY_WINDOW: usize = 100;

pub struct Metrics {
    started: Instant,
    requests: AtomicU64,
    commands: AtomicU64,
    messages: AtomicU64,
    errors: AtomicU64,
    safety_checks: AtomicU64,
    blocked_dangerous: AtomicU64,
    blocked_critical: AtomicU64,
    latencies: Mutex<VecDeque<Duration>>,
    per_command: Mutex<BTreeMap<String, u64>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub requests: u64,
    pub commands: u64,
    pub messages: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub safety_checks: u64,
    pub blocked_dangerous: u64,
    pub blocked_critical: u64,
    pub avg_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub per_command: BTreeMap<String, u64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            requests: AtomicU64::new(0),
            commands: AtomicU64::new(0),
            messages: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            safety_checks: AtomicU64::new(0),
            blocked_dangerous: AtomicU64::new(0),
            blocked_critical: AtomicU64::new(0),
            latencies: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
            per_command: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn record_command(&self, name: &str) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.commands.fetch_add(1, Ordering::Relaxed);
        *lock(&self.per_command).entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn record_message(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a classification; confirmation-gated tiers count as blocked.
    pub fn record_safety(&self, tier: RiskTier) {
        self.safety_checks.fetch_add(1, Ordering::Relaxed);
        match tier {
            RiskTier::Dangerous => {
                self.blocked_dangerous.fetch_add(1, Ordering::Relaxed);
            }
            RiskTier::Critical => {
                self.blocked_critical.fetch_add(1, Ordering::Relaxed);
            }
            RiskTier::Safe | RiskTier::Moderate => {}
        }
    }

    pub fn record_latency(&self, elapsed: Duration) {
        let mut samples = lock(&self.latencies);
        if samples.len() == LATENCY_WINDOW {
            samples.pop_front();
        }
        samples.push_back(elapsed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let requests = self.requests.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let (avg, p95) = latency_stats(&lock(&self.latencies));
        MetricsSnapshot {
            uptime_secs: self.uptime().as_secs(),
            requests,
            commands: self.commands.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            errors,
            error_rate: if requests == 0 {
                0.0
            } else {
                errors as f64 / requests as f64
            },
            safety_checks: self.safety_checks.load(Ordering::Relaxed),
            blocked_dangerous: self.blocked_dangerous.load(Ordering::Relaxed),
            blocked_critical: self.blocked_critical.load(Ordering::Relaxed),
            avg_latency_ms: avg.as_millis() as u64,
            p95_latency_ms: p95.as_millis() as u64,
            per_command: lock(&self.per_command).clone(),
        }
    }

    /// Text for the `/metrics` command.
    pub fn render(&self) -> String {
        let s = self.snapshot();
        let mut out = format!(
            "*Metrics*\n\n\
             Uptime: {}\n\
             Requests: {} ({} messages, {} commands)\n\
             Errors: {} ({:.1}%)\n\
             Latency: avg {} ms, p95 {} ms\n\
             Safety checks: {} (blocked: {} dangerous, {} critical)",
            format_uptime(Duration::from_secs(s.uptime_secs)),
            s.requests,
            s.messages,
            s.commands,
            s.errors,
            s.error_rate * 100.0,
            s.avg_latency_ms,
            s.p95_latency_ms,
            s.safety_checks,
            s.blocked_dangerous,
            s.blocked_critical,
        );
        if !s.per_command.is_empty() {
            out.push_str("\n\nCommands:");
            for (name, count) in &s.per_command {
                out.push_str(&format!("\n  /{name}: {count}"));
            }
        }
        out
    }
}

fn latency_stats(samples: &VecDeque<Duration>) -> (Duration, Duration) {
    if samples.is_empty() {
        return (Duration::ZERO, Duration::ZERO);
    }
    let total: Duration = samples.iter().sum();
    let avg = total / samples.len() as u32;
    let mut sorted: Vec<Duration> = samples.iter().copied().collect();
    sorted.sort();
    let idx = ((sorted.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
    (avg, sorted[idx.min(sorted.len() - 1)])
}

/// `1d 2h 3m 4s`, leading zero units omitted.
pub fn format_uptime(d: Duration) -> String {
    let secs = d.as_secs();
    let (days, hours, mins, s) = (secs / 86_400, secs / 3600 % 24, secs / 60 % 60, secs % 60);
    if days > 0 {
        format!("{days}d {hours}h {mins}m {s}s")
    } else if hours > 0 {
        format!("{hours}h {mins}m {s}s")
    } else if mins > 0 {
        format!("{mins}m {s}s")
    } else {
        format!("{s}s")
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(Duration::from_secs(4)), "4s");
        assert_eq!(format_uptime(Duration::from_secs(3 * 60 + 4)), "3m 4s");
        assert_eq!(
            format_uptime(Duration::from_secs(86_400 + 2 * 3600 + 3 * 60 + 4)),
            "1d 2h 3m 4s"
        );
    }

    #[test]
    fn latency_window_is_bounded() {
        let m = Metrics::new();
        for ms in 1..=150u64 {
            m.record_latency(Duration::from_millis(ms));
        }
        let s = m.snapshot();
        // Window holds 51..=150.
        assert_eq!(s.avg_latency_ms, 100);
        assert_eq!(s.p95_latency_ms, 145);
    }

    #[test]
    fn counters_and_error_rate() {
        let m = Metrics::new();
        m.record_message();
        m.record_message();
        m.record_command("status");
        m.record_command("status");
        m.record_error();
        m.record_safety(RiskTier::Safe);
        m.record_safety(RiskTier::Dangerous);
        m.record_safety(RiskTier::Critical);

        let s = m.snapshot();
        assert_eq!(s.requests, 4);
        assert_eq!(s.messages, 2);
        assert_eq!(s.commands, 2);
        assert_eq!(s.error_rate, 0.25);
        assert_eq!(s.safety_checks, 3);
        assert_eq!((s.blocked_dangerous, s.blocked_critical), (1, 1));
        assert_eq!(s.per_command.get("status"), Some(&2));
        assert!(m.render().contains("/status: 2"));
    }
}
