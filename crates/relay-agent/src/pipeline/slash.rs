//! Chat commands, intercepted before rate limiting and the safety gate.
//!
//! Unknown `/words` are not commands here; they go to the backend as text.

use relay_core::UserId;
use relay_sessions::SessionError;
use tracing::info;

use crate::metrics::format_uptime;

use super::dispatch::Dispatcher;
use super::inbox::{wide_status, WideCounts};

/// Known model aliases for user-friendly switching.
const MODEL_ALIASES: &[(&str, &str)] = &[
    ("opus", "claude-opus-4-6"),
    ("sonnet", "claude-sonnet-4-6"),
    ("haiku", "claude-haiku-4-5"),
];

/// Resolve an alias or a full `claude-*` model ID.
fn resolve_model(input: &str) -> Option<String> {
    let lower = input.to_lowercase();
    MODEL_ALIASES
        .iter()
        .find(|(alias, full)| lower == *alias || lower == *full)
        .map(|(_, full)| full.to_string())
        .or_else(|| lower.starts_with("claude-").then_some(lower))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Status,
    New(Option<String>),
    Sessions,
    Switch(Option<String>),
    Rename(Option<String>, Option<String>),
    Kill(Option<String>),
    Model(Option<String>),
    Verbose,
    Wide,
    Accept,
    Cancel,
    Metrics,
    Stop,
}

/// What the dispatcher does with a handled command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    Text(String),
    /// Run this prompt through classification and the backend.
    Run(String),
}

impl Command {
    /// Parse `/name args`.  A `@botname` suffix on the command is ignored.
    pub fn parse(text: &str) -> Option<Self> {
        let trimmed = text.trim();
        let rest = trimmed.strip_prefix('/')?;
        let mut parts = rest.split_whitespace();
        let head = parts.next()?;
        let name = head.split('@').next().unwrap_or(head).to_lowercase();
        let mut arg = || parts.next().map(String::from);

        let cmd = match name.as_str() {
            "start" => Self::Start,
            "help" => Self::Help,
            "status" => Self::Status,
            "new" => Self::New(arg()),
            "sessions" => Self::Sessions,
            "switch" => Self::Switch(arg()),
            "rename" => {
                let old = arg();
                Self::Rename(old, arg())
            }
            "kill" => Self::Kill(arg()),
            "model" => Self::Model(arg()),
            "verbose" => Self::Verbose,
            "wide" | "wide_context" => Self::Wide,
            "accept" => Self::Accept,
            "cancel" => Self::Cancel,
            "metrics" => Self::Metrics,
            "stop" => Self::Stop,
            _ => return None,
        };
        Some(cmd)
    }

    /// Name used for per-command metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Help => "help",
            Self::Status => "status",
            Self::New(_) => "new",
            Self::Sessions => "sessions",
            Self::Switch(_) => "switch",
            Self::Rename(..) => "rename",
            Self::Kill(_) => "kill",
            Self::Model(_) => "model",
            Self::Verbose => "verbose",
            Self::Wide => "wide",
            Self::Accept => "accept",
            Self::Cancel => "cancel",
            Self::Metrics => "metrics",
            Self::Stop => "stop",
        }
    }
}

const HELP: &str = "*Commands*\n\
- /help - show this help\n\
- /status - backend, session and request status\n\
- /new [name] - start a new session\n\
- /sessions - list your sessions\n\
- /switch <name> - switch session\n\
- /rename <old> <new> - rename a session\n\
- /kill <name> - delete a session\n\
- /model [opus|sonnet|haiku] - show or set the session model\n\
- /verbose - toggle live progress\n\
- /wide - collect several messages and files\n\
- /accept - send the collected context\n\
- /cancel - drop the collected context or a pending confirmation\n\
- /metrics - request metrics\n\
- /stop - stop the running operation";

impl Dispatcher {
    /// Run one command for `user`.  Called inside the user's lane.
    pub(super) async fn handle_command(&self, user: UserId, cmd: Command) -> CommandReply {
        info!(user_id = %user, command = cmd.name(), "command received");
        let text = match cmd {
            Command::Start => format!(
                "Welcome! Send me a task or a question and I will hand it to the agent.\n\n{HELP}"
            ),
            Command::Help => HELP.to_string(),
            Command::Status => self.status_text(user).await,
            Command::New(name) => self.new_session(user, name.as_deref()),
            Command::Sessions => self.sessions_text(user),
            Command::Switch(None) => "Usage: /switch <name>".to_string(),
            Command::Switch(Some(name)) => match self.sessions.switch(user, &name) {
                Ok(_) => format!("Switched to session `{name}`."),
                Err(e) => session_error(e),
            },
            Command::Rename(Some(old), Some(new)) => {
                match self.sessions.rename(user, &old, &new) {
                    Ok(()) => format!("Session `{old}` renamed to `{new}`."),
                    Err(e) => session_error(e),
                }
            }
            Command::Rename(..) => "Usage: /rename <old> <new>".to_string(),
            Command::Kill(None) => "Usage: /kill <name>".to_string(),
            Command::Kill(Some(name)) => match self.sessions.delete(user, &name) {
                Ok(()) => format!(
                    "Session `{name}` deleted. Active session: `{}`.",
                    self.sessions.active_name(user)
                ),
                Err(e) => session_error(e),
            },
            Command::Model(arg) => self.model(user, arg.as_deref()),
            Command::Verbose => {
                if self.verbose.toggle(user) {
                    "Verbose mode enabled. You will see the agent's actions as they happen."
                        .to_string()
                } else {
                    "Verbose mode disabled.".to_string()
                }
            }
            Command::Wide => {
                self.inbox.start_wide(user);
                wide_status(WideCounts::default())
            }
            Command::Accept => match self.inbox.take_wide(user) {
                Some(prompt) => return CommandReply::Run(prompt),
                None => "No active wide context.".to_string(),
            },
            Command::Cancel => {
                if self.inbox.cancel_wide(user) {
                    "Wide context mode cancelled.".to_string()
                } else if self.confirmations.remove(user).is_some() {
                    "Operation cancelled.".to_string()
                } else {
                    "Nothing to cancel.".to_string()
                }
            }
            Command::Metrics => self.metrics.render(),
            // Handled outside the lane.
            Command::Stop => "No operation in progress.".to_string(),
        };
        CommandReply::Text(text)
    }

    fn new_session(&self, user: UserId, name: Option<&str>) -> String {
        self.confirmations.remove(user);
        self.inbox.clear(user);
        self.limiter.reset(user);

        if let Some(name) = name.filter(|n| self.sessions.contains(user, n)) {
            return match self.sessions.switch(user, name) {
                Ok(_) => {
                    self.sessions.clear(user);
                    format!("Switched to existing session `{name}` and cleared its conversation.")
                }
                Err(e) => session_error(e),
            };
        }
        match self.sessions.create(user, name) {
            Ok(session) => format!("New session `{}` started.", session.name()),
            Err(e) => session_error(e),
        }
    }

    fn sessions_text(&self, user: UserId) -> String {
        let sessions = self.sessions.list(user);
        if sessions.is_empty() {
            return "No sessions yet. Send a message or use /new.".to_string();
        }
        let mut out = String::from("*Sessions*\n");
        for s in sessions {
            let marker = if s.is_active { " (active)" } else { "" };
            out.push_str(&format!(
                "\n- `{}`{marker}: {} messages, idle {}",
                s.name,
                s.message_count,
                format_uptime(std::time::Duration::from_secs(s.idle_secs)),
            ));
            if let Some(model) = &s.model {
                out.push_str(&format!(", model {model}"));
            }
        }
        out
    }

    fn model(&self, user: UserId, arg: Option<&str>) -> String {
        let Some(arg) = arg else {
            let current = self
                .sessions
                .list(user)
                .into_iter()
                .find(|s| s.is_active)
                .and_then(|s| s.model)
                .unwrap_or_else(|| "default".to_string());
            return format!(
                "Current model: *{current}*\n\nAvailable: `/model opus` | `/model sonnet` | `/model haiku` | `/model default`"
            );
        };

        let model = if arg.eq_ignore_ascii_case("default") {
            None
        } else {
            match resolve_model(arg) {
                Some(m) => Some(m),
                None => {
                    return format!(
                        "Unknown model `{arg}`. Available: `opus`, `sonnet`, `haiku`, or a full `claude-*` ID."
                    )
                }
            }
        };
        match self.sessions.set_model(user, model.clone()) {
            Ok(session) => format!(
                "Model for session `{}` set to *{}*.",
                session.name(),
                model.as_deref().unwrap_or("default")
            ),
            Err(e) => session_error(e),
        }
    }

    async fn status_text(&self, user: UserId) -> String {
        let healthy = self.backend.health_check().await;
        let snapshot = self.metrics.snapshot();
        let stats = self.sessions.stats();
        let active = self.sessions.active_name(user);
        let model = self
            .sessions
            .list(user)
            .into_iter()
            .find(|s| s.name == active)
            .and_then(|s| s.model)
            .unwrap_or_else(|| "default".to_string());
        let on_off = |b: bool| if b { "on" } else { "off" };

        format!(
            "*Status*\n\n\
             Backend: {} ({})\n\
             Session: `{active}` ({} of yours, {} total)\n\
             Model: {model}\n\
             Verbose: {}\n\
             Pending confirmation: {}\n\
             Wide context: {}\n\
             Uptime: {}\n\
             Requests: {} (errors: {})",
            self.backend.name(),
            if healthy { "healthy" } else { "unavailable" },
            self.sessions.user_count(user),
            stats.sessions,
            on_off(self.verbose.is_enabled(user)),
            if self.confirmations.contains(user) { "yes" } else { "no" },
            on_off(self.inbox.is_wide(user)),
            format_uptime(self.metrics.uptime()),
            snapshot.requests,
            snapshot.errors,
        )
    }
}

fn session_error(e: SessionError) -> String {
    format!("Error: {e}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_with_args_and_bot_suffix() {
        assert_eq!(Command::parse("/help"), Some(Command::Help));
        assert_eq!(Command::parse("  /STATUS@relay_bot "), Some(Command::Status));
        assert_eq!(
            Command::parse("/new research"),
            Some(Command::New(Some("research".to_string())))
        );
        assert_eq!(Command::parse("/new"), Some(Command::New(None)));
        assert_eq!(
            Command::parse("/rename a b"),
            Some(Command::Rename(Some("a".to_string()), Some("b".to_string())))
        );
        assert_eq!(Command::parse("/wide_context"), Some(Command::Wide));
    }

    #[test]
    fn non_commands_pass_through() {
        assert_eq!(Command::parse("hello"), None);
        assert_eq!(Command::parse("/etc/passwd is world readable?"), None);
        assert_eq!(Command::parse("/compact"), None);
        assert_eq!(Command::parse("/"), None);
    }

    #[test]
    fn model_aliases_resolve() {
        assert_eq!(resolve_model("Opus").as_deref(), Some("claude-opus-4-6"));
        assert_eq!(resolve_model("claude-haiku-4-5").as_deref(), Some("claude-haiku-4-5"));
        assert_eq!(
            resolve_model("claude-sonnet-4-5-20250929").as_deref(),
            Some("claude-sonnet-4-5-20250929")
        );
        assert_eq!(resolve_model("gpt-4"), None);
    }
}
