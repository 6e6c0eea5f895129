use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::config::BackendConfig;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backend::{BackendError, BackendRequest, ExecutionBackend};
use crate::stream::{parse_stream_line, BackendEvent};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);
/// Stderr kept for error messages.
const STDERR_MAX: usize = 2000;

/// Backend that delegates to the Claude Code CLI (`claude -p`).
///
/// Claude Code runs its own tools (Bash, Read, Write, ...).  We stream its
/// `stream-json` output line by line so tool use shows up as progress while
/// the run is still going.
pub struct ClaudeCliBackend {
    command: String,
    workspace_dir: String,
    system_prompt: Option<String>,
    /// Tools allowed in pipe mode. Empty = no `--allowedTools` flag.
    allowed_tools: Vec<String>,
    default_model: Option<String>,
}

impl ClaudeCliBackend {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            workspace_dir: ".".to_string(),
            system_prompt: None,
            allowed_tools: Vec::new(),
            default_model: None,
        }
    }

    /// Build from config, reading the system prompt file if one is set.
    pub fn from_config(cfg: &BackendConfig) -> Result<Self, BackendError> {
        let system_prompt = match &cfg.system_prompt_path {
            Some(path) => Some(std::fs::read_to_string(path).map_err(|e| {
                BackendError::Unavailable(format!("failed to read system prompt {path}: {e}"))
            })?),
            None => None,
        };
        Ok(Self {
            command: cfg.command.clone(),
            workspace_dir: cfg.workspace_dir.clone(),
            system_prompt,
            allowed_tools: cfg.allowed_tools.clone(),
            default_model: cfg.model.clone(),
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    fn build_command(
        &self,
        req: &BackendRequest,
    ) -> Result<(Command, Option<tempfile::NamedTempFile>), BackendError> {
        let mut cmd = Command::new(&self.command);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--add-dir")
            .arg(&self.workspace_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if std::path::Path::new(&self.workspace_dir).is_dir() {
            cmd.current_dir(&self.workspace_dir);
        }

        if let Some(model) = req.model.as_ref().or(self.default_model.as_ref()) {
            cmd.arg("--model").arg(model);
        }
        if let Some(conversation) = &req.conversation {
            cmd.arg("--resume").arg(conversation);
        }

        // Allow tools in pipe mode (without this, sandbox blocks Bash, etc.).
        if !self.allowed_tools.is_empty() {
            if self.allowed_tools.len() == 1 && self.allowed_tools[0] == "*" {
                cmd.arg("--dangerously-skip-permissions");
            } else {
                for tool in &self.allowed_tools {
                    cmd.arg("--allowedTools").arg(tool);
                }
            }
        }

        // Keep the temp file alive until the child exits.
        let sys_file = match &self.system_prompt {
            Some(prompt) => {
                let file = tempfile::Builder::new()
                    .prefix("relay-sys-")
                    .suffix(".txt")
                    .tempfile()
                    .map_err(|e| {
                        BackendError::Unavailable(format!("failed to create temp file: {e}"))
                    })?;
                std::fs::write(file.path(), prompt).map_err(|e| {
                    BackendError::Unavailable(format!("failed to write system prompt: {e}"))
                })?;
                cmd.arg("--system-prompt-file").arg(file.path());
                Some(file)
            }
            None => None,
        };

        Ok((cmd, sys_file))
    }
}

#[async_trait]
impl ExecutionBackend for ClaudeCliBackend {
    fn name(&self) -> &str {
        "claude-cli"
    }

    async fn run(
        &self,
        req: &BackendRequest,
        tx: mpsc::Sender<BackendEvent>,
    ) -> Result<(), BackendError> {
        let (mut cmd, _sys_file) = self.build_command(req)?;

        debug!(
            command = %self.command,
            session = %req.session,
            resume = req.conversation.is_some(),
            prompt_len = req.prompt.len(),
            "spawning claude CLI"
        );

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BackendError::Unavailable(format!(
                    "claude CLI not found at '{}', install Claude Code first",
                    self.command
                ))
            } else {
                BackendError::Unavailable(format!("failed to spawn claude CLI: {e}"))
            }
        })?;

        // Write prompt to stdin, then close it.
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(req.prompt.as_bytes()).await.map_err(|e| {
                BackendError::Unavailable(format!("failed to write to claude stdin: {e}"))
            })?;
            drop(stdin);
        }

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Unavailable("claude stdout not captured".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut finished = false;

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| BackendError::Parse(format!("failed to read claude output: {e}")))?
        {
            for event in parse_stream_line(&line) {
                if matches!(event, BackendEvent::Done { .. } | BackendEvent::Error { .. }) {
                    finished = true;
                }
                if tx.send(event).await.is_err() {
                    // Receiver gone: the dispatch was cancelled. Dropping
                    // `child` kills the process.
                    return Err(BackendError::Cancelled);
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| BackendError::Unavailable(format!("claude CLI process error: {e}")))?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() && !finished {
            let code = status.code().unwrap_or(-1);
            warn!(code, "claude CLI exited with failure");
            return Err(BackendError::Process {
                code,
                message: truncate(stderr.trim(), STDERR_MAX).to_string(),
            });
        }

        if !finished {
            let _ = tx
                .send(BackendEvent::Done {
                    text: None,
                    conversation: None,
                })
                .await;
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        let probe = Command::new(&self.command)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(HEALTH_TIMEOUT, probe).await {
            Ok(Ok(out)) => out.status.success(),
            Ok(Err(e)) => {
                debug!(error = %e, "claude CLI health check failed");
                false
            }
            Err(_) => {
                debug!("claude CLI health check timed out");
                false
            }
        }
    }
}

/// Truncate a string for error messages on a char boundary.
fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
