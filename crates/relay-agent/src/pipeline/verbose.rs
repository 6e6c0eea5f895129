//! Live progress for users who opted in with `/verbose`.
//!
//! Progress lines are buffered per user and flushed as one status message
//! once enough lines pile up or the flush interval has passed.  Later
//! flushes edit the same status message.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use relay_channels::{Chunker, Delivery, MessageHandle};
use relay_core::config::VerboseConfig;
use relay_core::UserId;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct VerboseContext {
    lines: Vec<String>,
    status: Option<MessageHandle>,
    total_actions: usize,
    last_flush: Instant,
}

impl VerboseContext {
    fn new() -> Self {
        Self {
            lines: Vec::new(),
            status: None,
            total_actions: 0,
            last_flush: Instant::now(),
        }
    }
}

pub struct VerboseBuffer {
    /// Verbose-enabled users in enable order; the LRU end is evicted at the cap.
    enabled: Mutex<LruCache<UserId, ()>>,
    contexts: Mutex<HashMap<UserId, VerboseContext>>,
    config: VerboseConfig,
    chunker: Chunker,
    delivery: Delivery,
}

impl VerboseBuffer {
    pub fn new(config: VerboseConfig, chunker: Chunker, delivery: Delivery) -> Self {
        let cap = NonZeroUsize::new(config.max_users).unwrap_or(NonZeroUsize::MIN);
        Self {
            enabled: Mutex::new(LruCache::new(cap)),
            contexts: Mutex::new(HashMap::new()),
            config,
            chunker,
            delivery,
        }
    }

    pub fn is_enabled(&self, user: UserId) -> bool {
        lock(&self.enabled).contains(&user)
    }

    pub fn enabled_count(&self) -> usize {
        lock(&self.enabled).len()
    }

    pub fn enable(&self, user: UserId) {
        let evicted = lock(&self.enabled).push(user, ());
        if let Some((old, ())) = evicted.filter(|(old, _)| *old != user) {
            lock(&self.contexts).remove(&old);
            info!(user_id = %old, "verbose users limit reached, evicted oldest user");
        }
    }

    pub fn disable(&self, user: UserId) {
        lock(&self.enabled).pop(&user);
        lock(&self.contexts).remove(&user);
    }

    /// Flip verbose mode; returns the new state.
    pub fn toggle(&self, user: UserId) -> bool {
        if self.is_enabled(user) {
            self.disable(user);
            false
        } else {
            self.enable(user);
            true
        }
    }

    pub fn has_context(&self, user: UserId) -> bool {
        lock(&self.contexts).contains_key(&user)
    }

    /// A status message was delivered for the current run.
    pub fn has_status(&self, user: UserId) -> bool {
        lock(&self.contexts)
            .get(&user)
            .is_some_and(|ctx| ctx.status.is_some())
    }

    /// Buffer one progress line.  Returns false when the line was dropped
    /// or the user is not verbose.
    pub fn add_line(&self, user: UserId, raw: &str) -> bool {
        if !self.is_enabled(user) {
            return false;
        }
        let Some(line) = format_line(raw, self.config.max_line_len) else {
            return false;
        };
        let mut contexts = lock(&self.contexts);
        let ctx = contexts.entry(user).or_insert_with(VerboseContext::new);
        ctx.lines.push(line);
        ctx.total_actions += 1;
        true
    }

    /// Deliver buffered lines when `force` is set, the batch is full, or
    /// the flush interval has passed.
    pub async fn flush(&self, user: UserId, force: bool) {
        let (text, status) = {
            let mut contexts = lock(&self.contexts);
            let Some(ctx) = contexts.get_mut(&user) else {
                return;
            };
            if ctx.lines.is_empty() {
                return;
            }
            let due = force
                || ctx.lines.len() >= self.config.batch_size
                || ctx.last_flush.elapsed() >= self.config.flush_interval();
            if !due {
                return;
            }
            let text = format!(
                "*Processing...* ({} actions)\n\n{}",
                ctx.total_actions,
                ctx.lines.join("\n")
            );
            ctx.lines.clear();
            ctx.last_flush = Instant::now();
            (text, ctx.status)
        };

        let chunks = self.chunker.chunk(&text).chunks;
        let mut first = None;
        for (i, chunk) in chunks.iter().enumerate() {
            let reuse = if i == 0 { status } else { None };
            let handle = match reuse {
                Some(handle) => match self.delivery.edit(&handle, chunk).await {
                    Ok(()) => Some(handle),
                    Err(e) => {
                        warn!(user_id = %user, error = %e, "failed to update verbose message");
                        self.delivery.notify(user, chunk).await
                    }
                },
                None => self.delivery.notify(user, chunk).await,
            };
            if i == 0 {
                first = handle;
            }
        }

        if let Some(handle) = first {
            if let Some(ctx) = lock(&self.contexts).get_mut(&user) {
                ctx.status = Some(handle);
            }
        }
        debug!(user_id = %user, parts = chunks.len(), "verbose flushed");
    }

    /// Flush what is left, mark the status message completed, and drop the
    /// context.  No-op without a context.
    pub async fn finalize(&self, user: UserId) {
        if !self.has_context(user) {
            return;
        }
        self.flush(user, true).await;

        let Some(ctx) = lock(&self.contexts).remove(&user) else {
            return;
        };
        if let Some(status) = ctx.status.filter(|_| ctx.total_actions > 0) {
            let done = format!("Completed ({} actions)", ctx.total_actions);
            if let Err(e) = self.delivery.edit(&status, &done).await {
                warn!(user_id = %user, error = %e, "failed to finalize verbose message");
            }
        }
    }

    /// Drop buffered lines without delivering them.
    pub fn discard(&self, user: UserId) {
        lock(&self.contexts).remove(&user);
    }
}

/// Format a raw progress line for display, or `None` for noise.
pub fn format_line(raw: &str, max_len: usize) -> Option<String> {
    let line = raw.trim();
    if line.is_empty() {
        return None;
    }
    if (line.starts_with('{') || line.starts_with('['))
        && serde_json::from_str::<serde_json::Value>(line)
            .is_ok_and(|v| v.is_object() || v.is_array())
    {
        return None;
    }
    // Backticks would break the inline code span.
    let line = line.replace('`', "'");
    let line = if line.chars().count() > max_len {
        let kept: String = line.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    } else {
        line
    };
    Some(format!("`{line}`"))
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use relay_channels::{ChannelError, MemoryTransport, RetryPolicy};

    use super::*;

    const USER: UserId = UserId(42);

    fn buffer(max_users: usize) -> (VerboseBuffer, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        let delivery = Delivery::new(
            transport.clone(),
            RetryPolicy {
                max_attempts: 1,
                base_delay: Duration::from_millis(10),
            },
        );
        let config = VerboseConfig {
            batch_size: 3,
            flush_interval_ms: 3000,
            max_line_len: 100,
            max_users,
        };
        let chunker = Chunker::new(4000).unwrap();
        (VerboseBuffer::new(config, chunker, delivery), transport)
    }

    #[test]
    fn noise_lines_are_dropped() {
        assert_eq!(format_line("   \t ", 100), None);
        assert_eq!(format_line(r#"{"type":"system"}"#, 100), None);
        assert_eq!(format_line("[1, 2, 3]", 100), None);
        // Looks like JSON but is not.
        assert_eq!(format_line("[warn] disk low", 100).as_deref(), Some("`[warn] disk low`"));
    }

    #[test]
    fn long_lines_are_truncated() {
        let line = format_line(&"a".repeat(150), 100).unwrap();
        assert!(line.chars().count() <= 102);
        assert!(line.ends_with("...`"));
    }

    #[test]
    fn enable_past_cap_evicts_oldest() {
        let (buf, _) = buffer(3);
        for id in 1..=4 {
            buf.enable(UserId(id));
        }
        assert_eq!(buf.enabled_count(), 3);
        assert!(!buf.is_enabled(UserId(1)));
        assert!(buf.is_enabled(UserId(4)));
    }

    #[test]
    fn disabled_user_gets_no_context() {
        let (buf, _) = buffer(3);
        assert!(!buf.add_line(USER, "Bash: ls"));
        assert!(!buf.has_context(USER));
        assert!(buf.toggle(USER));
        assert!(buf.add_line(USER, "Bash: ls"));
        assert!(!buf.toggle(USER));
        assert!(!buf.has_context(USER));
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_on_batch_size_and_edits_status() {
        let (buf, transport) = buffer(3);
        buf.enable(USER);

        buf.add_line(USER, "Read: a.rs");
        buf.flush(USER, false).await;
        assert!(transport.sent().is_empty());
        // Buffered but not yet shown.
        assert!(buf.has_context(USER));
        assert!(!buf.has_status(USER));

        buf.add_line(USER, "Read: b.rs");
        buf.add_line(USER, "Bash: cargo fmt");
        buf.flush(USER, false).await;
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text.starts_with("*Processing...* (3 actions)"));
        assert!(buf.has_status(USER));

        // The interval alone also triggers a flush, into the same message.
        buf.add_line(USER, "Write: c.rs");
        tokio::time::advance(Duration::from_secs(3)).await;
        buf.flush(USER, false).await;
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text.contains("`Write: c.rs`"));

        buf.finalize(USER).await;
        assert_eq!(transport.sent()[0].text, "Completed (4 actions)");
        assert!(!buf.has_context(USER));
        // Idempotent.
        buf.finalize(USER).await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_edit_falls_back_to_new_message() {
        let (buf, transport) = buffer(3);
        buf.enable(USER);
        buf.add_line(USER, "one");
        buf.flush(USER, true).await;

        transport.fail_next_edit(ChannelError::Rejected("message to edit not found".into()));
        buf.add_line(USER, "two");
        buf.flush(USER, true).await;
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn discard_drops_without_sending() {
        let (buf, transport) = buffer(3);
        buf.enable(USER);
        buf.add_line(USER, "one");
        buf.discard(USER);
        buf.finalize(USER).await;
        assert!(transport.sent().is_empty());
    }
}
