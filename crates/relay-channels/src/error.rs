use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to a chat transport.
///
/// Adapters map their native failures onto these variants so that the
/// retry logic in [`Delivery`](crate::delivery::Delivery) can tell transient
/// problems from permanent ones.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The transport asked us to back off for a fixed time.
    #[error("Rate limited by transport, retry after {secs}s")]
    RetryAfter { secs: u64 },

    /// Connection reset, DNS failure, 5xx and friends.
    #[error("Network error: {0}")]
    Network(String),

    /// An operation exceeded its allowed time budget.
    #[error("Operation timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The transport refused the request outright.
    #[error("Message rejected: {0}")]
    Rejected(String),

    /// An edit carried the same text the message already has.
    #[error("Message is not modified")]
    NotModified,

    /// The message to edit no longer exists.
    #[error("Message not found")]
    NotFound,

    /// Rich-text markup could not be parsed by the transport.
    #[error("Formatting rejected: {0}")]
    ParseEntities(String),

    /// Every retry failed.
    #[error("Delivery failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    /// The channel-specific configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ChannelError {
    /// Worth another attempt after a pause.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChannelError::RetryAfter { .. } | ChannelError::Network(_) | ChannelError::Timeout { .. }
        )
    }

    /// Server-mandated pause, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ChannelError::RetryAfter { secs } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}
