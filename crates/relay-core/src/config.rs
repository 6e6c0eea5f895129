use std::fmt;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Hard per-message ceiling of the reference chat transport.
pub const TRANSPORT_HARD_LIMIT: usize = 4096;
/// Smallest chunk budget the chunker accepts.
pub const MIN_CHUNK_SIZE: usize = 100;
pub const DEFAULT_CHUNK_SIZE: usize = 4000;
pub const DEFAULT_SESSION_NAME: &str = "main";

/// Top-level config (relay.toml + RELAY_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub verbose: VerboseConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Numeric user IDs or usernames allowed to talk to the bot.
    /// Empty means nobody; `"*"` admits everyone.
    #[serde(default)]
    pub allow_users: Vec<String>,
}

impl fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("bot_token", &if self.bot_token.is_empty() { "" } else { "<redacted>" })
            .field("allow_users", &self.allow_users)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Executable of the CLI agent.
    #[serde(default = "default_backend_command")]
    pub command: String,
    /// Default model for new sessions; `None` lets the CLI decide.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: String,
    #[serde(default)]
    pub system_prompt_path: Option<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: default_backend_command(),
            model: None,
            workspace_dir: default_workspace_dir(),
            system_prompt_path: None,
            allowed_tools: Vec::new(),
            timeout_secs: default_backend_timeout(),
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Bucket size, i.e. the burst a user may send at once.
    #[serde(default = "default_rate_capacity")]
    pub capacity: f64,
    /// Tokens restored per second.
    #[serde(default = "default_refill_rate")]
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: default_rate_capacity(),
            refill_per_sec: default_refill_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "default_max_total_sessions")]
    pub max_total: usize,
    #[serde(default = "default_max_sessions_per_user")]
    pub max_per_user: usize,
    /// Idle seconds after which a session is replaced on next access.
    #[serde(default = "default_session_expiry")]
    pub expiry_secs: u64,
    #[serde(default = "default_session_name")]
    pub default_name: String,
    #[serde(default = "default_session_name_max_len")]
    pub name_max_len: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_total: default_max_total_sessions(),
            max_per_user: default_max_sessions_per_user(),
            expiry_secs: default_session_expiry(),
            default_name: default_session_name(),
            name_max_len: default_session_name_max_len(),
        }
    }
}

impl SessionsConfig {
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerboseConfig {
    /// Buffered lines that force a flush.
    #[serde(default = "default_verbose_batch")]
    pub batch_size: usize,
    #[serde(default = "default_verbose_interval")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_verbose_line_len")]
    pub max_line_len: usize,
    /// Cap on simultaneously verbose users.
    #[serde(default = "default_verbose_users")]
    pub max_users: usize,
}

impl Default for VerboseConfig {
    fn default() -> Self {
        Self {
            batch_size: default_verbose_batch(),
            flush_interval_ms: default_verbose_interval(),
            max_line_len: default_verbose_line_len(),
            max_users: default_verbose_users(),
        }
    }
}

impl VerboseConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub max_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Attempts per message, the first send included.
    #[serde(default = "default_delivery_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delivery_base_delay")]
    pub base_delay_ms: u64,
    /// Pause between consecutive chunks of one answer.
    #[serde(default = "default_inter_chunk_delay")]
    pub inter_chunk_delay_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_delivery_attempts(),
            base_delay_ms: default_delivery_base_delay(),
            inter_chunk_delay_ms: default_inter_chunk_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_critical_phrases")]
    pub critical_phrases: Vec<String>,
    #[serde(default = "default_affirmatives")]
    pub affirmatives: Vec<String>,
    #[serde(default = "default_negatives")]
    pub negatives: Vec<String>,
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_secs: u64,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            critical_phrases: default_critical_phrases(),
            affirmatives: default_affirmatives(),
            negatives: default_negatives(),
            confirmation_timeout_secs: default_confirmation_timeout(),
            max_pending: default_max_pending(),
        }
    }
}

impl SafetyConfig {
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Quiet period that closes a burst of messages. Zero disables bursting.
    #[serde(default)]
    pub accumulation_delay_ms: u64,
    #[serde(default = "default_batch_messages")]
    pub max_messages: usize,
    #[serde(default = "default_batch_files")]
    pub max_files: usize,
    #[serde(default = "default_wide_timeout")]
    pub wide_timeout_secs: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            accumulation_delay_ms: 0,
            max_messages: default_batch_messages(),
            max_files: default_batch_files(),
            wide_timeout_secs: default_wide_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_max_extracted_chars")]
    pub max_extracted_chars: usize,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_file_bytes: default_max_file_bytes(),
            max_extracted_chars: default_max_extracted_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Serve `GET /health` when true.
    #[serde(default)]
    pub health_enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            health_enabled: false,
            bind: default_bind(),
            port: default_port(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_backend_command() -> String {
    "claude".to_string()
}
fn default_workspace_dir() -> String {
    "/home/projects".to_string()
}
fn default_backend_timeout() -> u64 {
    300
}
fn default_rate_capacity() -> f64 {
    10.0
}
fn default_refill_rate() -> f64 {
    0.5
}
fn default_max_total_sessions() -> usize {
    1000
}
fn default_max_sessions_per_user() -> usize {
    10
}
fn default_session_expiry() -> u64 {
    3600
}
fn default_session_name() -> String {
    DEFAULT_SESSION_NAME.to_string()
}
fn default_session_name_max_len() -> usize {
    32
}
fn default_verbose_batch() -> usize {
    10
}
fn default_verbose_interval() -> u64 {
    3000
}
fn default_verbose_line_len() -> usize {
    100
}
fn default_verbose_users() -> usize {
    100
}
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_delivery_attempts() -> u32 {
    3
}
fn default_delivery_base_delay() -> u64 {
    1000
}
fn default_inter_chunk_delay() -> u64 {
    500
}
fn default_critical_phrases() -> Vec<String> {
    vec![
        "CONFIRM CRITICAL OPERATION".to_string(),
        "PODTVERZHDAYU KRITICHESKUYU OPERATSIYU".to_string(),
    ]
}
fn default_affirmatives() -> Vec<String> {
    ["yes", "y", "da", "confirm", "ok"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_negatives() -> Vec<String> {
    ["no", "n", "net", "cancel", "otmena"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_confirmation_timeout() -> u64 {
    300
}
fn default_max_pending() -> usize {
    100
}
fn default_batch_messages() -> usize {
    50
}
fn default_batch_files() -> usize {
    20
}
fn default_wide_timeout() -> u64 {
    300
}
fn default_max_file_bytes() -> u64 {
    20 * 1024 * 1024
}
fn default_max_extracted_chars() -> usize {
    100_000
}
fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    18790
}
fn default_shutdown_timeout() -> u64 {
    30
}

impl RelayConfig {
    /// Load config from a TOML file with RELAY_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. `RELAY_CONFIG` env var
    ///   3. ~/.relay/relay.toml
    ///
    /// A missing file is not an error; every field has a default.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("RELAY_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        let config: RelayConfig = Figment::from(Serialized::defaults(RelayConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("RELAY_").ignore(&["CONFIG"]).split("__"))
            .extract()
            .map_err(|e| RelayError::Config(e.to_string()))?;

        config.validate()?;
        tracing::debug!(path = %path, "configuration loaded");
        Ok(config)
    }

    /// Reject values the pipeline cannot honour.
    pub fn validate(&self) -> Result<()> {
        let max = self.chunking.max_size;
        if !(MIN_CHUNK_SIZE..=TRANSPORT_HARD_LIMIT).contains(&max) {
            return Err(RelayError::Config(format!(
                "chunking.max_size must be within {MIN_CHUNK_SIZE}..={TRANSPORT_HARD_LIMIT}, got {max}"
            )));
        }
        if self.rate_limit.enabled
            && (self.rate_limit.capacity < 1.0 || self.rate_limit.refill_per_sec <= 0.0)
        {
            return Err(RelayError::Config(
                "rate_limit needs capacity >= 1 and a positive refill_per_sec".to_string(),
            ));
        }
        if self.sessions.max_total == 0 || self.sessions.max_per_user == 0 {
            return Err(RelayError::Config(
                "session caps must be greater than zero".to_string(),
            ));
        }
        let name = &self.sessions.default_name;
        if name.is_empty()
            || name.chars().count() > self.sessions.name_max_len
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(RelayError::Config(format!(
                "sessions.default_name must be 1..={} characters of [A-Za-z0-9_-], got {name:?}",
                self.sessions.name_max_len
            )));
        }
        if self.verbose.max_line_len < 4 || self.verbose.max_users == 0 {
            return Err(RelayError::Config(
                "verbose.max_line_len must be >= 4 and verbose.max_users > 0".to_string(),
            ));
        }
        if self.delivery.max_attempts == 0 {
            return Err(RelayError::Config(
                "delivery.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.safety.critical_phrases.is_empty() || self.safety.affirmatives.is_empty() {
            return Err(RelayError::Config(
                "safety needs at least one critical phrase and one affirmative".to_string(),
            ));
        }
        let blank = |list: &[String]| list.iter().any(|p| p.trim().is_empty());
        if blank(&self.safety.critical_phrases) || blank(&self.safety.affirmatives) {
            return Err(RelayError::Config(
                "safety phrases and affirmatives must not be blank".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.relay/relay.toml", home)
}
