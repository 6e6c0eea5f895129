use async_trait::async_trait;
use relay_core::UserId;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// Reference to a delivered message, used for later edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageHandle {
    pub user: UserId,
    pub message_id: i64,
}

/// Outbound side of a chat platform.
///
/// Implementations must be `Send + Sync` so a single adapter can serve every
/// per-user dispatch concurrently.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable lowercase identifier (e.g. `"telegram"`).
    fn name(&self) -> &str;

    /// Deliver `text` to the private chat of `user`.
    ///
    /// `text` is already within the transport's size limit; adapters must not
    /// split it further.
    async fn send(&self, user: UserId, text: &str) -> Result<MessageHandle, ChannelError>;

    /// Replace the text of a message sent earlier.
    async fn edit(&self, handle: &MessageHandle, text: &str) -> Result<(), ChannelError>;

    /// Show a "typing…" indicator.  Best effort; the default does nothing.
    async fn typing(&self, _user: UserId) -> Result<(), ChannelError> {
        Ok(())
    }
}
