//! Per-message orchestration.
//!
//! Every incoming message goes through:
//! commands → admission → batching → (user lane) → confirmation →
//! classification → session → backend run → verbose relay → chunked delivery.
//!
//! Messages from one user are serialized on that user's lane; different
//! users never wait for each other.  `/stop` skips the lane and cancels the
//! user's in-flight run.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use relay_channels::{Chunker, Delivery, RetryPolicy, Transport};
use relay_core::config::{FilesConfig, RelayConfig};
use relay_core::{RelayError, UserId};
use relay_safety::{ConfirmationStore, Lookup, RiskTier, SafetyGate};
use relay_sessions::SessionStore;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{BackendError, BackendRequest, ExecutionBackend};
use crate::extract::ContentExtractor;
use crate::metrics::Metrics;
use crate::ratelimit::RateLimiter;
use crate::stream::BackendEvent;

use super::inbox::{render_file, wide_status, Inbox, WideRejection};
use super::slash::{Command, CommandReply};
use super::verbose::VerboseBuffer;

/// Telegram-style typing status lasts ~5 s; refresh a little earlier.
const TYPING_INTERVAL: Duration = Duration::from_secs(4);
/// Backend events buffered between the backend and the dispatch loop.
const EVENT_BUFFER: usize = 64;
const DEFAULT_CAPTION: &str = "Analyze this file";
const EMPTY_ANSWER: &str = "Done. The command produced no output.";

/// How a message was handled.  Returned for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    RateLimited,
    Command,
    /// Held in a burst or wide context for later.
    Batched,
    AwaitingConfirmation(RiskTier),
    /// The user declined a pending confirmation.
    Declined,
    Reprompted,
    ConfirmationExpired,
    Completed,
    Failed,
    /// Cancelled by `/stop` or shutdown.
    Stopped,
    /// Uploaded file refused (size, type, feature off).
    Rejected,
}

/// An uploaded file as announced by the transport, before download.
#[derive(Debug, Clone)]
pub struct Document {
    pub file_name: String,
    pub caption: Option<String>,
    /// Size reported by the transport, in bytes.
    pub size: u64,
}

enum RunResult {
    Finished {
        text: String,
        conversation: Option<String>,
    },
    Failed(String),
    Cancelled,
}

/// Aborts the typing refresh loop when dropped.
struct TypingHandle(tokio::task::JoinHandle<()>);

impl TypingHandle {
    fn start(delivery: Delivery, user: UserId) -> Self {
        Self(tokio::spawn(async move {
            loop {
                delivery.typing(user).await;
                sleep(TYPING_INTERVAL).await;
            }
        }))
    }
}

impl Drop for TypingHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct Dispatcher {
    pub(crate) gate: SafetyGate,
    pub(crate) confirmations: ConfirmationStore,
    pub(crate) limiter: RateLimiter,
    pub(crate) sessions: SessionStore,
    pub(crate) verbose: VerboseBuffer,
    pub(crate) inbox: Inbox,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) backend: Arc<dyn ExecutionBackend>,
    chunker: Chunker,
    delivery: Delivery,
    extractor: Arc<dyn ContentExtractor>,
    files: FilesConfig,
    backend_timeout: Duration,
    inter_chunk_delay: Duration,
    lanes: DashMap<UserId, Arc<Mutex<()>>>,
    active: DashMap<UserId, CancellationToken>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// Wire the pipeline from validated config.
    pub fn new(
        config: &RelayConfig,
        transport: Arc<dyn Transport>,
        backend: Arc<dyn ExecutionBackend>,
        extractor: Arc<dyn ContentExtractor>,
    ) -> relay_core::Result<Self> {
        let gate =
            SafetyGate::new(&config.safety).map_err(|e| RelayError::Config(e.to_string()))?;
        let chunker = Chunker::new(config.chunking.max_size)
            .map_err(|e| RelayError::Config(e.to_string()))?;
        let delivery = Delivery::new(transport, RetryPolicy::from_config(&config.delivery));

        Ok(Self {
            gate,
            confirmations: ConfirmationStore::new(
                config.safety.confirmation_timeout(),
                config.safety.max_pending,
            ),
            limiter: RateLimiter::from_config(&config.rate_limit),
            sessions: SessionStore::new(config.sessions.clone()),
            verbose: VerboseBuffer::new(config.verbose.clone(), chunker.clone(), delivery.clone()),
            inbox: Inbox::new(config.batching.clone()),
            metrics: Arc::new(Metrics::new()),
            backend,
            chunker,
            delivery,
            extractor,
            files: config.files.clone(),
            backend_timeout: config.backend.timeout(),
            inter_chunk_delay: Duration::from_millis(config.delivery.inter_chunk_delay_ms),
            lanes: DashMap::new(),
            active: DashMap::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn backend(&self) -> &Arc<dyn ExecutionBackend> {
        &self.backend
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn verbose(&self) -> &VerboseBuffer {
        &self.verbose
    }

    pub fn has_pending_confirmation(&self, user: UserId) -> bool {
        self.confirmations.contains(user)
    }

    /// Backend runs currently in flight.
    pub fn in_flight(&self) -> usize {
        self.active.len()
    }

    /// Largest upload accepted, for transports that check before download.
    pub fn max_file_bytes(&self) -> Option<u64> {
        self.files.enabled.then_some(self.files.max_file_bytes)
    }

    /// Cancel every in-flight run and refuse new ones.
    pub fn shutdown(&self) {
        info!(in_flight = self.active.len(), "dispatcher shutting down");
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Handle one text message from `user`.
    #[instrument(skip(self, text), fields(user_id = %user, len = text.len()))]
    pub async fn handle_text(self: &Arc<Self>, user: UserId, text: String) -> DispatchOutcome {
        if self.is_shutting_down() {
            return DispatchOutcome::Stopped;
        }
        let started = Instant::now();

        // Commands are never rate limited, so `/stop` always gets through.
        if let Some(cmd) = Command::parse(&text) {
            self.metrics.record_command(cmd.name());
            if cmd == Command::Stop {
                self.stop(user).await;
                return DispatchOutcome::Command;
            }
            let lane = self.enter_lane(user).await;
            let outcome = match self.handle_command(user, cmd).await {
                CommandReply::Text(reply) => {
                    self.delivery.notify(user, &reply).await;
                    DispatchOutcome::Command
                }
                CommandReply::Run(prompt) => self.classify_and_execute(user, prompt).await,
            };
            self.leave_lane(user, lane);
            self.metrics.record_latency(started.elapsed());
            return outcome;
        }

        if !self.admit(user).await {
            return DispatchOutcome::RateLimited;
        }
        self.metrics.record_message();
        let pending = self.confirmations.contains(user);

        if !pending && self.inbox.is_wide(user) {
            match self.inbox.add_wide_message(user, text) {
                Ok(counts) => {
                    debug!(messages = counts.messages, files = counts.files, "message added to wide context");
                    self.delivery.notify(user, &wide_status(counts)).await;
                }
                Err(rejection) => self.notify_wide_rejection(user, rejection).await,
            }
            return DispatchOutcome::Batched;
        }

        let text = match self.inbox.burst_delay().filter(|_| !pending) {
            Some(delay) => {
                let generation = self.inbox.push_burst(user, text);
                tokio::select! {
                    _ = self.shutdown.cancelled() => return DispatchOutcome::Stopped,
                    _ = sleep(delay) => {}
                }
                match self.inbox.take_burst(user, generation) {
                    Some(combined) => combined,
                    None => return DispatchOutcome::Batched,
                }
            }
            None => text,
        };

        let lane = self.enter_lane(user).await;
        let outcome = self.process(user, text).await;
        self.leave_lane(user, lane);
        self.metrics.record_latency(started.elapsed());
        outcome
    }

    /// Handle an uploaded file.  `fetch` downloads the content and is only
    /// called once the file passed admission and the size check.
    #[instrument(skip(self, doc, fetch), fields(user_id = %user, file = %doc.file_name, size = doc.size))]
    pub async fn handle_document<F, Fut>(
        self: &Arc<Self>,
        user: UserId,
        doc: Document,
        fetch: F,
    ) -> DispatchOutcome
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Vec<u8>, String>> + Send,
    {
        if self.is_shutting_down() {
            return DispatchOutcome::Stopped;
        }
        if !self.files.enabled {
            self.delivery
                .notify(user, "File processing is disabled.")
                .await;
            return DispatchOutcome::Rejected;
        }
        let started = Instant::now();
        if !self.admit(user).await {
            return DispatchOutcome::RateLimited;
        }
        self.metrics.record_message();

        if doc.size > self.files.max_file_bytes {
            let reply = format!(
                "File too large ({:.1} MB). Maximum size is {:.1} MB.",
                mb(doc.size),
                mb(self.files.max_file_bytes)
            );
            self.delivery.notify(user, &reply).await;
            return DispatchOutcome::Rejected;
        }

        let bytes = match fetch().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "file download failed");
                self.metrics.record_error();
                self.delivery
                    .notify(user, &format!("Failed to download file: {e}"))
                    .await;
                return DispatchOutcome::Failed;
            }
        };

        let content = match self.extractor.extract(&bytes, &doc.file_name).await {
            Ok(content) => content,
            Err(e) => {
                info!(error = %e, "file rejected");
                self.delivery
                    .notify(user, &format!("Cannot process file: {e}"))
                    .await;
                return DispatchOutcome::Rejected;
            }
        };

        if self.inbox.is_wide(user) {
            match self.inbox.add_wide_file(user, doc.file_name.clone(), content) {
                Ok(counts) => {
                    self.delivery.notify(user, &wide_status(counts)).await;
                }
                Err(rejection) => self.notify_wide_rejection(user, rejection).await,
            }
            return DispatchOutcome::Batched;
        }

        self.delivery
            .notify(user, &format!("Processing file: {}", doc.file_name))
            .await;
        let caption = doc
            .caption
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_CAPTION);
        let prompt = format!("{caption}\n\n{}", render_file(&doc.file_name, &content));

        let lane = self.enter_lane(user).await;
        // Only the caption is classified; file contents are data.
        let outcome = self.classify_as(user, caption, prompt).await;
        self.leave_lane(user, lane);
        self.metrics.record_latency(started.elapsed());
        outcome
    }

    // -----------------------------------------------------------------------
    // Pipeline stages
    // -----------------------------------------------------------------------

    async fn admit(&self, user: UserId) -> bool {
        if self.limiter.try_consume(user) {
            return true;
        }
        let wait = self.limiter.retry_after(user).as_secs_f64().ceil().max(1.0) as u64;
        warn!(user_id = %user, retry_after_secs = wait, "rate limit exceeded");
        self.delivery
            .notify(
                user,
                &format!("Rate limit exceeded. Please wait {wait} seconds."),
            )
            .await;
        false
    }

    async fn enter_lane(&self, user: UserId) -> OwnedMutexGuard<()> {
        let lane = self.lanes.entry(user).or_default().clone();
        lane.lock_owned().await
    }

    /// Release the lane and drop it from the map when nobody else holds it.
    fn leave_lane(&self, user: UserId, guard: OwnedMutexGuard<()>) {
        drop(guard);
        self.lanes
            .remove_if(&user, |_, lane| Arc::strong_count(lane) == 1);
    }

    /// Confirmation resolution, then classification.
    async fn process(&self, user: UserId, text: String) -> DispatchOutcome {
        match self.confirmations.lookup(user) {
            Lookup::None => self.classify_and_execute(user, text).await,
            Lookup::Expired => {
                self.delivery
                    .notify(user, "Confirmation expired. Please send the command again.")
                    .await;
                DispatchOutcome::ConfirmationExpired
            }
            Lookup::Pending(pending) => {
                if self.gate.is_confirmation_valid(&text, pending.tier) {
                    self.confirmations.remove(user);
                    info!(user_id = %user, tier = %pending.tier, "risky command confirmed");
                    self.delivery
                        .notify(user, "Confirmed. Executing command...")
                        .await;
                    self.execute(user, pending.command).await
                } else if self.gate.is_cancellation(&text) {
                    self.confirmations.remove(user);
                    info!(user_id = %user, tier = %pending.tier, "risky command declined");
                    self.delivery.notify(user, "Operation cancelled.").await;
                    DispatchOutcome::Declined
                } else {
                    self.delivery
                        .notify(user, &self.gate.reprompt(pending.tier))
                        .await;
                    DispatchOutcome::Reprompted
                }
            }
        }
    }

    async fn classify_and_execute(&self, user: UserId, text: String) -> DispatchOutcome {
        let probe = text.clone();
        self.classify_as(user, &probe, text).await
    }

    /// Classify `probe`; run `prompt` when it is allowed through.
    async fn classify_as(&self, user: UserId, probe: &str, prompt: String) -> DispatchOutcome {
        let assessment = self.gate.check(probe);
        self.metrics.record_safety(assessment.tier);

        if assessment.requires_confirmation {
            warn!(
                user_id = %user,
                tier = %assessment.tier,
                pattern = assessment.description.as_deref().unwrap_or(""),
                "risky command held for confirmation"
            );
            self.confirmations.insert(user, assessment.tier, prompt);
            if let Some(message) = &assessment.message {
                self.delivery.notify(user, message).await;
            }
            return DispatchOutcome::AwaitingConfirmation(assessment.tier);
        }

        if let Some(info) = &assessment.message {
            self.delivery.notify(user, info).await;
        }
        self.execute(user, prompt).await
    }

    /// Run `prompt` on the user's active session and deliver the answer.
    async fn execute(&self, user: UserId, prompt: String) -> DispatchOutcome {
        let session = match self.sessions.resolve(user, None) {
            Ok(session) => session,
            Err(e) => {
                self.metrics.record_error();
                self.delivery.notify(user, &format!("Error: {e}")).await;
                return DispatchOutcome::Failed;
            }
        };
        let _pin = self.sessions.pin(session.key.clone());

        let cancel = self.shutdown.child_token();
        self.active.insert(user, cancel.clone());
        let typing = TypingHandle::start(self.delivery.clone(), user);

        let req = BackendRequest {
            prompt,
            conversation: session.conversation.clone(),
            model: session.model.clone(),
            session: session.key.to_string(),
        };
        info!(
            user_id = %user,
            session = %session.key.name,
            backend = self.backend.name(),
            prompt_len = req.prompt.len(),
            "running backend"
        );
        let result = self.run_backend(user, &req, &cancel).await;
        drop(typing);

        let outcome = match result {
            RunResult::Finished { text, conversation } => {
                self.sessions.record_turn(&session.key, conversation);
                self.verbose.finalize(user).await;
                self.deliver_answer(user, &text, &cancel).await
            }
            RunResult::Cancelled => {
                let had_output = self.verbose.has_status(user);
                self.verbose.discard(user);
                if had_output {
                    self.delivery.notify(user, "Operation stopped.").await;
                }
                DispatchOutcome::Stopped
            }
            RunResult::Failed(message) => {
                error!(user_id = %user, error = %message, "backend run failed");
                self.metrics.record_error();
                self.verbose.discard(user);
                self.delivery
                    .notify(user, &format!("Error: {message}"))
                    .await;
                DispatchOutcome::Failed
            }
        };

        self.active.remove(&user);
        outcome
    }

    async fn run_backend(
        &self,
        user: UserId,
        req: &BackendRequest,
        cancel: &CancellationToken,
    ) -> RunResult {
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let mut run = self.backend.run(req, tx);
        let deadline = sleep(self.backend_timeout);
        tokio::pin!(deadline);

        let mut answer = String::new();
        let mut final_text = None;
        let mut conversation = None;
        let mut run_finished = false;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return RunResult::Cancelled,
                _ = &mut deadline => {
                    let err = BackendError::Timeout { secs: self.backend_timeout.as_secs() };
                    return RunResult::Failed(err.to_string());
                }
                res = &mut run, if !run_finished => {
                    run_finished = true;
                    match res {
                        Ok(()) => {}
                        Err(BackendError::Cancelled) => return RunResult::Cancelled,
                        Err(e) => return RunResult::Failed(e.to_string()),
                    }
                }
                event = rx.recv() => match event {
                    Some(BackendEvent::TextDelta { text }) => answer.push_str(&text),
                    Some(BackendEvent::Progress { line }) => {
                        if self.verbose.add_line(user, &line) {
                            self.verbose.flush(user, false).await;
                        }
                    }
                    Some(BackendEvent::Done { text, conversation: handle }) => {
                        final_text = text;
                        conversation = handle;
                    }
                    Some(BackendEvent::Error { message }) => return RunResult::Failed(message),
                    // All senders gone: the run returned and the buffer is drained.
                    None => break,
                },
            }
        }

        let text = final_text
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(answer);
        RunResult::Finished { text, conversation }
    }

    /// Chunk and send the final answer in order, stopping between parts if
    /// the dispatch is cancelled.
    async fn deliver_answer(
        &self,
        user: UserId,
        text: &str,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        let text = if text.trim().is_empty() { EMPTY_ANSWER } else { text };
        let chunks = self.chunker.chunk(text).chunks;
        let total = chunks.len();

        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = sleep(self.inter_chunk_delay) => {}
                }
            }
            if cancel.is_cancelled() {
                let notice = format!("Operation stopped after {i} of {total} parts.");
                self.delivery.notify(user, &notice).await;
                return DispatchOutcome::Stopped;
            }
            if let Err(e) = self.delivery.send(user, chunk).await {
                error!(user_id = %user, part = i + 1, total, error = %e, "failed to deliver response");
                self.metrics.record_error();
                self.delivery
                    .notify(user, &format!("Error: failed to deliver response ({e})"))
                    .await;
                return DispatchOutcome::Failed;
            }
        }
        debug!(user_id = %user, parts = total, "response delivered");
        DispatchOutcome::Completed
    }

    /// Cancel the user's in-flight run, if any.
    async fn stop(&self, user: UserId) {
        let reply = match self.active.get(&user) {
            Some(token) => {
                token.cancel();
                info!(user_id = %user, "dispatch stopped by user");
                "Stopping current operation..."
            }
            None => "No operation in progress.",
        };
        self.delivery.notify(user, reply).await;
    }

    async fn notify_wide_rejection(&self, user: UserId, rejection: WideRejection) {
        let reply = match rejection {
            WideRejection::Inactive => "No active wide context.".to_string(),
            WideRejection::MessageLimit(max) => format!(
                "Wide context limit reached ({max} messages). Send /accept or /cancel."
            ),
            WideRejection::FileLimit(max) => {
                format!("Wide context limit reached ({max} files). Send /accept or /cancel.")
            }
        };
        self.delivery.notify(user, &reply).await;
    }
}

fn mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}
