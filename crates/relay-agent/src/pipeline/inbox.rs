//! Message batching: short bursts and manual `/wide` collection.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use relay_core::config::BatchingConfig;
use relay_core::UserId;
use tokio::time::Instant;

/// Why an item was not added to a wide context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WideRejection {
    /// No wide context is open (never started, or it timed out).
    Inactive,
    MessageLimit(usize),
    FileLimit(usize),
}

/// Item counts of an open wide context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WideCounts {
    pub messages: usize,
    pub files: usize,
}

#[derive(Debug, Default)]
struct Burst {
    messages: Vec<String>,
    generation: u64,
}

#[derive(Debug)]
struct Wide {
    messages: Vec<String>,
    files: Vec<(String, String)>,
    started: Instant,
}

impl Wide {
    fn counts(&self) -> WideCounts {
        WideCounts {
            messages: self.messages.len(),
            files: self.files.len(),
        }
    }
}

pub struct Inbox {
    bursts: Mutex<HashMap<UserId, Burst>>,
    wide: Mutex<HashMap<UserId, Wide>>,
    config: BatchingConfig,
}

impl Inbox {
    pub fn new(config: BatchingConfig) -> Self {
        Self {
            bursts: Mutex::new(HashMap::new()),
            wide: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Quiet period that closes a burst; `None` when bursting is off.
    pub fn burst_delay(&self) -> Option<Duration> {
        (self.config.accumulation_delay_ms > 0)
            .then(|| Duration::from_millis(self.config.accumulation_delay_ms))
    }

    /// Append to the user's burst.  Returns the generation to hand back to
    /// [`take_burst`](Self::take_burst) after the quiet period.
    pub fn push_burst(&self, user: UserId, text: String) -> u64 {
        let mut bursts = lock(&self.bursts);
        let burst = bursts.entry(user).or_default();
        burst.messages.push(text);
        burst.generation += 1;
        burst.generation
    }

    /// Take the combined burst if no newer message arrived since
    /// `generation`.  The newest message's caller gets the whole burst.
    pub fn take_burst(&self, user: UserId, generation: u64) -> Option<String> {
        let mut bursts = lock(&self.bursts);
        if bursts.get(&user)?.generation != generation {
            return None;
        }
        let burst = bursts.remove(&user)?;
        let combined = burst.messages.join("\n\n");
        (!combined.trim().is_empty()).then_some(combined)
    }

    pub fn drop_burst(&self, user: UserId) -> bool {
        lock(&self.bursts).remove(&user).is_some()
    }

    /// Open a fresh wide context, replacing any open one.
    pub fn start_wide(&self, user: UserId) {
        lock(&self.wide).insert(
            user,
            Wide {
                messages: Vec::new(),
                files: Vec::new(),
                started: Instant::now(),
            },
        );
    }

    /// Counts of the open wide context; an expired one is dropped.
    pub fn wide_counts(&self, user: UserId) -> Option<WideCounts> {
        let mut wide = lock(&self.wide);
        self.live(&mut wide, user).map(|w| w.counts())
    }

    pub fn is_wide(&self, user: UserId) -> bool {
        self.wide_counts(user).is_some()
    }

    pub fn add_wide_message(
        &self,
        user: UserId,
        text: String,
    ) -> Result<WideCounts, WideRejection> {
        let max = self.config.max_messages;
        let mut wide = lock(&self.wide);
        let ctx = self.live(&mut wide, user).ok_or(WideRejection::Inactive)?;
        if ctx.messages.len() >= max {
            return Err(WideRejection::MessageLimit(max));
        }
        ctx.messages.push(text);
        Ok(ctx.counts())
    }

    pub fn add_wide_file(
        &self,
        user: UserId,
        name: String,
        content: String,
    ) -> Result<WideCounts, WideRejection> {
        let max = self.config.max_files;
        let mut wide = lock(&self.wide);
        let ctx = self.live(&mut wide, user).ok_or(WideRejection::Inactive)?;
        if ctx.files.len() >= max {
            return Err(WideRejection::FileLimit(max));
        }
        ctx.files.push((name, content));
        Ok(ctx.counts())
    }

    /// Close the wide context and return its combined text.  `None` when
    /// nothing is open or nothing was collected.
    pub fn take_wide(&self, user: UserId) -> Option<String> {
        let mut wide = lock(&self.wide);
        self.live(&mut wide, user)?;
        let ctx = wide.remove(&user)?;
        let parts = ctx
            .messages
            .into_iter()
            .chain(
                ctx.files
                    .iter()
                    .map(|(name, content)| render_file(name, content)),
            )
            .collect::<Vec<_>>();
        let combined = parts.join("\n\n");
        (!combined.trim().is_empty()).then_some(combined)
    }

    pub fn cancel_wide(&self, user: UserId) -> bool {
        lock(&self.wide).remove(&user).is_some()
    }

    /// Drop everything pending for `user`.
    pub fn clear(&self, user: UserId) {
        self.drop_burst(user);
        self.cancel_wide(user);
    }

    fn live<'a>(&self, wide: &'a mut HashMap<UserId, Wide>, user: UserId) -> Option<&'a mut Wide> {
        let timeout = Duration::from_secs(self.config.wide_timeout_secs);
        if wide.get(&user)?.started.elapsed() > timeout {
            wide.remove(&user);
            return None;
        }
        wide.get_mut(&user)
    }
}

/// Frame an uploaded file's text for the prompt.
pub fn render_file(name: &str, content: &str) -> String {
    format!("=== File: {name} ===\n{content}\n=== End of file ===")
}

/// Wide-mode status text shown after every collected item.
pub fn wide_status(counts: WideCounts) -> String {
    format!(
        "*Wide Context Mode Active*\n\n\
         Messages: {}\n\
         Files: {}\n\n\
         Send /accept when ready, or /cancel to abort.",
        counts.messages, counts.files
    )
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER: UserId = UserId(3);

    fn inbox() -> Inbox {
        Inbox::new(BatchingConfig {
            accumulation_delay_ms: 500,
            max_messages: 2,
            max_files: 1,
            wide_timeout_secs: 60,
        })
    }

    #[test]
    fn newest_burst_message_takes_everything() {
        let inbox = inbox();
        let first = inbox.push_burst(USER, "part one".into());
        let second = inbox.push_burst(USER, "part two".into());
        assert_eq!(inbox.take_burst(USER, first), None);
        assert_eq!(
            inbox.take_burst(USER, second).as_deref(),
            Some("part one\n\npart two")
        );
        assert_eq!(inbox.take_burst(USER, second), None);
    }

    #[test]
    fn wide_collects_messages_and_files() {
        let inbox = inbox();
        assert_eq!(
            inbox.add_wide_message(USER, "x".into()),
            Err(WideRejection::Inactive)
        );

        inbox.start_wide(USER);
        inbox.add_wide_message(USER, "look at this".into()).unwrap();
        inbox.add_wide_message(USER, "and this".into()).unwrap();
        assert_eq!(
            inbox.add_wide_message(USER, "too many".into()),
            Err(WideRejection::MessageLimit(2))
        );
        let counts = inbox
            .add_wide_file(USER, "a.txt".into(), "hello".into())
            .unwrap();
        assert_eq!(counts, WideCounts { messages: 2, files: 1 });
        assert_eq!(
            inbox.add_wide_file(USER, "b.txt".into(), "x".into()),
            Err(WideRejection::FileLimit(1))
        );

        let combined = inbox.take_wide(USER).unwrap();
        assert_eq!(
            combined,
            "look at this\n\nand this\n\n=== File: a.txt ===\nhello\n=== End of file ==="
        );
        assert!(!inbox.is_wide(USER));
    }

    #[tokio::test(start_paused = true)]
    async fn wide_context_expires() {
        let inbox = inbox();
        inbox.start_wide(USER);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!inbox.is_wide(USER));
        assert_eq!(inbox.take_wide(USER), None);
    }

    #[test]
    fn empty_wide_yields_nothing() {
        let inbox = inbox();
        inbox.start_wide(USER);
        assert_eq!(inbox.take_wide(USER), None);
        assert!(!inbox.cancel_wide(USER));
    }
}
