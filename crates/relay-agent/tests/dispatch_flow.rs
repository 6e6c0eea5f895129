//! End-to-end pipeline tests over an in-memory transport and a scripted backend.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use relay_agent::{
    BackendError, BackendEvent, BackendRequest, DispatchOutcome, Dispatcher, Document,
    ExecutionBackend, TextExtractor,
};
use relay_channels::{ChannelError, MemoryTransport};
use relay_core::{RelayConfig, UserId};
use relay_safety::RiskTier;
use tokio::sync::mpsc;

const USER: UserId = UserId(1001);

/// Replays a fixed event script and records every request it sees.
#[derive(Default)]
struct ScriptedBackend {
    script: Vec<BackendEvent>,
    /// Pause before emitting anything.
    delay: Option<Duration>,
    /// Pause after the script, before returning.
    stall: Option<Duration>,
    requests: Mutex<Vec<BackendRequest>>,
}

impl ScriptedBackend {
    fn answering(text: &str) -> Self {
        Self {
            script: vec![BackendEvent::Done {
                text: Some(text.to_string()),
                conversation: Some("conv-1".to_string()),
            }],
            ..Default::default()
        }
    }

    fn prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.prompt.clone())
            .collect()
    }

    fn requests(&self) -> Vec<BackendRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(
        &self,
        req: &BackendRequest,
        tx: mpsc::Sender<BackendEvent>,
    ) -> Result<(), BackendError> {
        self.requests.lock().unwrap().push(req.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        for event in &self.script {
            tx.send(event.clone())
                .await
                .map_err(|_| BackendError::Cancelled)?;
        }
        if let Some(stall) = self.stall {
            tokio::time::sleep(stall).await;
        }
        Ok(())
    }
}

fn config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.delivery.base_delay_ms = 10;
    config.delivery.inter_chunk_delay_ms = 10;
    config.rate_limit.capacity = 5.0;
    config.rate_limit.refill_per_sec = 0.5;
    config
}

fn dispatcher(
    config: &RelayConfig,
    backend: Arc<ScriptedBackend>,
) -> (Arc<Dispatcher>, Arc<MemoryTransport>) {
    let transport = Arc::new(MemoryTransport::new());
    let d = Dispatcher::new(
        config,
        transport.clone(),
        backend,
        Arc::new(TextExtractor::new(config.files.max_extracted_chars)),
    )
    .unwrap();
    (Arc::new(d), transport)
}

async fn fetched(bytes: &[u8]) -> Result<Vec<u8>, String> {
    Ok(bytes.to_vec())
}

fn last_text(transport: &MemoryTransport) -> String {
    transport.texts_for(USER).last().cloned().unwrap_or_default()
}

#[tokio::test(start_paused = true)]
async fn safe_message_runs_and_stores_conversation() {
    let backend = Arc::new(ScriptedBackend::answering("hi there"));
    let (d, transport) = dispatcher(&config(), backend.clone());

    let outcome = d.handle_text(USER, "echo hi".to_string()).await;
    assert_eq!(outcome, DispatchOutcome::Completed);
    assert_eq!(transport.texts_for(USER), vec!["hi there".to_string()]);
    assert_eq!(backend.prompts(), vec!["echo hi".to_string()]);

    // The second turn resumes the conversation the backend reported.
    d.handle_text(USER, "and again".to_string()).await;
    let reqs = backend.requests();
    assert_eq!(reqs[1].conversation.as_deref(), Some("conv-1"));
    assert_eq!(reqs[1].session, "user:1001:main");
}

#[tokio::test(start_paused = true)]
async fn dangerous_command_waits_for_yes() {
    let backend = Arc::new(ScriptedBackend::answering("removed"));
    let (d, transport) = dispatcher(&config(), backend.clone());

    let outcome = d.handle_text(USER, "rm -rf /important".to_string()).await;
    assert_eq!(
        outcome,
        DispatchOutcome::AwaitingConfirmation(RiskTier::Dangerous)
    );
    assert!(backend.prompts().is_empty());
    assert!(last_text(&transport).contains("DANGEROUS OPERATION"));
    assert!(d.has_pending_confirmation(USER));

    // An unrelated reply re-prompts and keeps the confirmation.
    let outcome = d.handle_text(USER, "what?".to_string()).await;
    assert_eq!(outcome, DispatchOutcome::Reprompted);
    assert!(d.has_pending_confirmation(USER));

    let outcome = d.handle_text(USER, "yes".to_string()).await;
    assert_eq!(outcome, DispatchOutcome::Completed);
    assert_eq!(backend.prompts(), vec!["rm -rf /important".to_string()]);
    assert!(!d.has_pending_confirmation(USER));
    assert_eq!(last_text(&transport), "removed");
}

#[tokio::test(start_paused = true)]
async fn critical_command_needs_the_phrase() {
    let backend = Arc::new(ScriptedBackend::answering("ok"));
    let (d, transport) = dispatcher(&config(), backend.clone());

    let outcome = d.handle_text(USER, "rm -rf /".to_string()).await;
    assert_eq!(outcome, DispatchOutcome::AwaitingConfirmation(RiskTier::Critical));
    assert!(last_text(&transport).contains("CONFIRM CRITICAL OPERATION"));

    assert_eq!(
        d.handle_text(USER, "yes".to_string()).await,
        DispatchOutcome::Reprompted
    );
    assert!(backend.prompts().is_empty());

    assert_eq!(
        d.handle_text(USER, "confirm critical operation".to_string())
            .await,
        DispatchOutcome::Completed
    );
    assert_eq!(backend.prompts(), vec!["rm -rf /".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn cancellation_clears_pending_command() {
    let backend = Arc::new(ScriptedBackend::answering("never"));
    let (d, transport) = dispatcher(&config(), backend.clone());

    d.handle_text(USER, "sudo reboot".to_string()).await;
    let outcome = d.handle_text(USER, "no".to_string()).await;
    assert_eq!(outcome, DispatchOutcome::Declined);
    assert_eq!(last_text(&transport), "Operation cancelled.");
    assert!(!d.has_pending_confirmation(USER));
    assert!(backend.prompts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn expired_confirmation_asks_to_resend() {
    let backend = Arc::new(ScriptedBackend::answering("never"));
    let (d, transport) = dispatcher(&config(), backend.clone());

    d.handle_text(USER, "shutdown now".to_string()).await;
    tokio::time::advance(Duration::from_secs(301)).await;

    let outcome = d.handle_text(USER, "yes".to_string()).await;
    assert_eq!(outcome, DispatchOutcome::ConfirmationExpired);
    assert!(last_text(&transport).contains("expired"));
    assert!(backend.prompts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn moderate_command_informs_and_runs() {
    let backend = Arc::new(ScriptedBackend::answering("vim removed"));
    let (d, transport) = dispatcher(&config(), backend.clone());

    let outcome = d.handle_text(USER, "apt remove vim".to_string()).await;
    assert_eq!(outcome, DispatchOutcome::Completed);
    let texts = transport.texts_for(USER);
    assert!(texts[0].starts_with("INFO:"));
    assert_eq!(texts[1], "vim removed");
}

#[tokio::test(start_paused = true)]
async fn rate_limited_user_is_told_to_wait() {
    let mut cfg = config();
    cfg.rate_limit.capacity = 2.0;
    let backend = Arc::new(ScriptedBackend::answering("ok"));
    let (d, transport) = dispatcher(&cfg, backend.clone());

    d.handle_text(USER, "one".to_string()).await;
    d.handle_text(USER, "two".to_string()).await;
    let outcome = d.handle_text(USER, "three".to_string()).await;
    assert_eq!(outcome, DispatchOutcome::RateLimited);
    assert_eq!(
        last_text(&transport),
        "Rate limit exceeded. Please wait 2 seconds."
    );
    assert_eq!(backend.prompts().len(), 2);

    // Other users are unaffected.
    let other = UserId(2002);
    assert_eq!(
        d.handle_text(other, "hello".to_string()).await,
        DispatchOutcome::Completed
    );
}

#[tokio::test(start_paused = true)]
async fn backend_timeout_is_a_single_error() {
    let mut cfg = config();
    cfg.backend.timeout_secs = 5;
    let backend = Arc::new(ScriptedBackend {
        delay: Some(Duration::from_secs(60)),
        ..ScriptedBackend::answering("late")
    });
    let (d, transport) = dispatcher(&cfg, backend.clone());

    let outcome = d.handle_text(USER, "slow task".to_string()).await;
    assert_eq!(outcome, DispatchOutcome::Failed);
    assert_eq!(
        transport.texts_for(USER),
        vec!["Error: Backend timed out after 5s".to_string()]
    );
    assert_eq!(d.in_flight(), 0);
    assert_eq!(d.metrics().snapshot().errors, 1);
}

#[tokio::test(start_paused = true)]
async fn backend_error_event_is_reported() {
    let backend = Arc::new(ScriptedBackend {
        script: vec![BackendEvent::Error {
            message: "quota exceeded".to_string(),
        }],
        ..Default::default()
    });
    let (d, transport) = dispatcher(&config(), backend);

    assert_eq!(
        d.handle_text(USER, "hi".to_string()).await,
        DispatchOutcome::Failed
    );
    assert_eq!(last_text(&transport), "Error: quota exceeded");
}

#[tokio::test(start_paused = true)]
async fn verbose_progress_is_relayed_then_completed() {
    let backend = Arc::new(ScriptedBackend {
        script: vec![
            BackendEvent::Progress {
                line: "Bash: ls".to_string(),
            },
            BackendEvent::Progress {
                line: r#"{"noise":true}"#.to_string(),
            },
            BackendEvent::TextDelta {
                text: "Listing done".to_string(),
            },
            BackendEvent::Done {
                text: None,
                conversation: None,
            },
        ],
        ..Default::default()
    });
    let (d, transport) = dispatcher(&config(), backend);

    d.handle_text(USER, "/verbose".to_string()).await;
    assert!(d.verbose().is_enabled(USER));
    transport.clear();

    let outcome = d.handle_text(USER, "list files".to_string()).await;
    assert_eq!(outcome, DispatchOutcome::Completed);
    // Status message finalized, then the answer assembled from deltas.
    assert_eq!(
        transport.texts_for(USER),
        vec!["Completed (1 actions)".to_string(), "Listing done".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn long_answers_arrive_in_parts() {
    let long = "word ".repeat(2000);
    let backend = Arc::new(ScriptedBackend::answering(&long));
    let (d, transport) = dispatcher(&config(), backend);

    d.handle_text(USER, "write a lot".to_string()).await;
    let texts = transport.texts_for(USER);
    assert!(texts.len() >= 3);
    assert!(texts[0].starts_with("[Part 1/"));
    assert!(texts.iter().all(|t| t.chars().count() <= 4000));
}

#[tokio::test(start_paused = true)]
async fn exhausted_delivery_surfaces_an_error() {
    let backend = Arc::new(ScriptedBackend::answering("answer"));
    let (d, transport) = dispatcher(&config(), backend);

    for _ in 0..3 {
        transport.fail_next_send(ChannelError::Network("connection reset".to_string()));
    }
    let outcome = d.handle_text(USER, "hello".to_string()).await;
    assert_eq!(outcome, DispatchOutcome::Failed);
    assert!(last_text(&transport).starts_with("Error: failed to deliver response"));
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_the_running_dispatch() {
    let backend = Arc::new(ScriptedBackend {
        delay: Some(Duration::from_secs(100)),
        ..ScriptedBackend::answering("too late")
    });
    let (d, transport) = dispatcher(&config(), backend);

    let running = {
        let d = d.clone();
        tokio::spawn(async move { d.handle_text(USER, "long job".to_string()).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(d.in_flight(), 1);

    assert_eq!(
        d.handle_text(USER, "/stop".to_string()).await,
        DispatchOutcome::Command
    );
    assert_eq!(running.await.unwrap(), DispatchOutcome::Stopped);
    assert!(!transport.texts_for(USER).contains(&"too late".to_string()));
}

#[tokio::test(start_paused = true)]
async fn rate_limited_user_can_still_stop() {
    let mut cfg = config();
    cfg.rate_limit.capacity = 1.0;
    cfg.rate_limit.refill_per_sec = 0.01;
    let backend = Arc::new(ScriptedBackend {
        delay: Some(Duration::from_secs(60)),
        ..ScriptedBackend::answering("too late")
    });
    let (d, transport) = dispatcher(&cfg, backend);

    let running = {
        let d = d.clone();
        tokio::spawn(async move { d.handle_text(USER, "long job".to_string()).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(
        d.handle_text(USER, "more".to_string()).await,
        DispatchOutcome::RateLimited
    );

    assert_eq!(
        d.handle_text(USER, "/stop".to_string()).await,
        DispatchOutcome::Command
    );
    assert_eq!(last_text(&transport), "Stopping current operation...");
    assert_eq!(running.await.unwrap(), DispatchOutcome::Stopped);
    assert_eq!(d.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_rejection_leaves_verbose_run_intact() {
    let mut cfg = config();
    cfg.rate_limit.capacity = 1.0;
    let backend = Arc::new(ScriptedBackend {
        script: vec![
            BackendEvent::Progress {
                line: "Bash: make".to_string(),
            },
            BackendEvent::Done {
                text: Some("done".to_string()),
                conversation: None,
            },
        ],
        delay: Some(Duration::from_secs(5)),
        ..Default::default()
    });
    let (d, transport) = dispatcher(&cfg, backend);

    d.handle_text(USER, "/verbose".to_string()).await;
    transport.clear();

    let running = {
        let d = d.clone();
        tokio::spawn(async move { d.handle_text(USER, "build it".to_string()).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(
        d.handle_text(USER, "are you done?".to_string()).await,
        DispatchOutcome::RateLimited
    );

    assert_eq!(running.await.unwrap(), DispatchOutcome::Completed);
    let texts = transport.texts_for(USER);
    assert_eq!(texts.len(), 3);
    assert!(texts[0].starts_with("Rate limit exceeded."));
    assert_eq!(texts[1], "Completed (1 actions)");
    assert_eq!(texts[2], "done");
}

#[tokio::test(start_paused = true)]
async fn stop_before_any_progress_is_shown_sends_no_notice() {
    let backend = Arc::new(ScriptedBackend {
        script: vec![BackendEvent::Progress {
            line: "Read: src/main.rs".to_string(),
        }],
        stall: Some(Duration::from_secs(100)),
        ..Default::default()
    });
    let (d, transport) = dispatcher(&config(), backend);

    d.handle_text(USER, "/verbose".to_string()).await;
    transport.clear();

    let running = {
        let d = d.clone();
        tokio::spawn(async move { d.handle_text(USER, "read it".to_string()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(d.verbose().has_context(USER));
    assert!(!d.verbose().has_status(USER));

    d.handle_text(USER, "/stop".to_string()).await;
    assert_eq!(running.await.unwrap(), DispatchOutcome::Stopped);
    assert_eq!(
        transport.texts_for(USER),
        vec!["Stopping current operation...".to_string()]
    );
    assert!(!d.verbose().has_context(USER));
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_everything() {
    let backend = Arc::new(ScriptedBackend {
        delay: Some(Duration::from_secs(100)),
        ..ScriptedBackend::answering("too late")
    });
    let (d, _transport) = dispatcher(&config(), backend);

    let running = {
        let d = d.clone();
        tokio::spawn(async move { d.handle_text(USER, "long job".to_string()).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    d.shutdown();
    assert_eq!(running.await.unwrap(), DispatchOutcome::Stopped);
    assert_eq!(
        d.handle_text(USER, "after".to_string()).await,
        DispatchOutcome::Stopped
    );
}

#[tokio::test(start_paused = true)]
async fn same_user_messages_are_serialized() {
    let backend = Arc::new(ScriptedBackend {
        delay: Some(Duration::from_secs(2)),
        ..ScriptedBackend::answering("done")
    });
    let (d, transport) = dispatcher(&config(), backend.clone());

    let first = {
        let d = d.clone();
        tokio::spawn(async move { d.handle_text(USER, "first".to_string()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = {
        let d = d.clone();
        tokio::spawn(async move { d.handle_text(USER, "second".to_string()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    // The second waits on the lane; only one run is in flight.
    assert_eq!(d.in_flight(), 1);

    assert_eq!(first.await.unwrap(), DispatchOutcome::Completed);
    assert_eq!(second.await.unwrap(), DispatchOutcome::Completed);
    assert_eq!(
        backend.prompts(),
        vec!["first".to_string(), "second".to_string()]
    );
    assert_eq!(transport.texts_for(USER).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn burst_messages_are_combined() {
    let mut cfg = config();
    cfg.batching.accumulation_delay_ms = 500;
    let backend = Arc::new(ScriptedBackend::answering("got it"));
    let (d, _transport) = dispatcher(&cfg, backend.clone());

    let first = {
        let d = d.clone();
        tokio::spawn(async move { d.handle_text(USER, "part one".to_string()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = d.handle_text(USER, "part two".to_string()).await;

    assert_eq!(first.await.unwrap(), DispatchOutcome::Batched);
    assert_eq!(second, DispatchOutcome::Completed);
    assert_eq!(backend.prompts(), vec!["part one\n\npart two".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn wide_context_collects_until_accept() {
    let backend = Arc::new(ScriptedBackend::answering("reviewed"));
    let (d, transport) = dispatcher(&config(), backend.clone());

    d.handle_text(USER, "/wide".to_string()).await;
    assert_eq!(
        d.handle_text(USER, "review this".to_string()).await,
        DispatchOutcome::Batched
    );
    let doc = Document {
        file_name: "main.rs".to_string(),
        caption: None,
        size: 12,
    };
    assert_eq!(
        d.handle_document(USER, doc, || fetched(b"fn main() {}")).await,
        DispatchOutcome::Batched
    );
    assert!(last_text(&transport).contains("Files: 1"));
    assert!(backend.prompts().is_empty());

    assert_eq!(
        d.handle_text(USER, "/accept".to_string()).await,
        DispatchOutcome::Completed
    );
    assert_eq!(
        backend.prompts(),
        vec![
            "review this\n\n=== File: main.rs ===\nfn main() {}\n=== End of file ===".to_string()
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn documents_are_extracted_and_run() {
    let backend = Arc::new(ScriptedBackend::answering("looks fine"));
    let (d, transport) = dispatcher(&config(), backend.clone());

    let doc = Document {
        file_name: "notes.md".to_string(),
        caption: None,
        size: 7,
    };
    assert_eq!(
        d.handle_document(USER, doc, || fetched(b"# Notes")).await,
        DispatchOutcome::Completed
    );
    assert_eq!(transport.texts_for(USER)[0], "Processing file: notes.md");
    assert_eq!(
        backend.prompts(),
        vec!["Analyze this file\n\n=== File: notes.md ===\n# Notes\n=== End of file ===".to_string()]
    );

    let binary = Document {
        file_name: "photo.png".to_string(),
        caption: Some("what is this".to_string()),
        size: 4,
    };
    assert_eq!(
        d.handle_document(USER, binary, || fetched(&[0x89, b'P', b'N', b'G'])).await,
        DispatchOutcome::Rejected
    );
    assert!(last_text(&transport).starts_with("Cannot process file"));
}

#[tokio::test(start_paused = true)]
async fn oversized_documents_are_never_downloaded() {
    let backend = Arc::new(ScriptedBackend::answering("unused"));
    let (d, transport) = dispatcher(&config(), backend.clone());

    let doc = Document {
        file_name: "dump.log".to_string(),
        caption: None,
        size: 50 * 1024 * 1024,
    };
    let outcome = d
        .handle_document(USER, doc, || async {
            Err::<Vec<u8>, String>("fetched an oversized file".to_string())
        })
        .await;
    assert_eq!(outcome, DispatchOutcome::Rejected);
    assert!(last_text(&transport).starts_with("File too large (50.0 MB)"));
    assert!(backend.prompts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn risky_caption_needs_confirmation() {
    let backend = Arc::new(ScriptedBackend::answering("applied"));
    let (d, _transport) = dispatcher(&config(), backend.clone());

    let doc = Document {
        file_name: "cleanup.sh".to_string(),
        caption: Some("run this then reboot".to_string()),
        size: 9,
    };
    let outcome = d.handle_document(USER, doc, || fetched(b"rm *.tmp\n")).await;
    assert_eq!(outcome, DispatchOutcome::AwaitingConfirmation(RiskTier::Dangerous));

    assert_eq!(
        d.handle_text(USER, "y".to_string()).await,
        DispatchOutcome::Completed
    );
    assert!(backend.prompts()[0].starts_with("run this then reboot\n\n=== File: cleanup.sh ==="));
}

#[tokio::test(start_paused = true)]
async fn session_commands_manage_contexts() {
    let mut cfg = config();
    cfg.rate_limit.enabled = false;
    let backend = Arc::new(ScriptedBackend::answering("ok"));
    let (d, transport) = dispatcher(&cfg, backend.clone());

    d.handle_text(USER, "/new research".to_string()).await;
    assert_eq!(last_text(&transport), "New session `research` started.");
    d.handle_text(USER, "/model opus".to_string()).await;
    d.handle_text(USER, "hello".to_string()).await;

    let req = &backend.requests()[0];
    assert_eq!(req.session, "user:1001:research");
    assert_eq!(req.model.as_deref(), Some("claude-opus-4-6"));

    d.handle_text(USER, "/sessions".to_string()).await;
    assert!(last_text(&transport).contains("`research` (active)"));

    d.handle_text(USER, "/kill research".to_string()).await;
    assert!(last_text(&transport).contains("deleted"));
    assert!(!d.sessions().contains(USER, "research"));

    d.handle_text(USER, "/status".to_string()).await;
    assert!(last_text(&transport).contains("Backend: scripted (healthy)"));
    d.handle_text(USER, "/metrics".to_string()).await;
    assert!(last_text(&transport).contains("/status: 1"));
}
