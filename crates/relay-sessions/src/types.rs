use std::fmt;

use chrono::{DateTime, Utc};
use relay_core::UserId;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

/// Sessions belong to a user and are addressed by name.
///
/// Display format: `user:{user_id}:{name}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub user: UserId,
    pub name: String,
}

impl SessionKey {
    pub fn new(user: UserId, name: impl Into<String>) -> Self {
        Self {
            user,
            name: name.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user:{}:{}", self.user, self.name)
    }
}

/// One conversation context with the execution backend.
#[derive(Debug, Clone)]
pub struct Session {
    /// UUIDv7, regenerated when an expired session is replaced.
    pub id: String,
    pub key: SessionKey,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Instant,
    /// Handle returned by the backend to resume the conversation.
    pub conversation: Option<String>,
    /// Model override; `None` uses the backend default.
    pub model: Option<String>,
    pub message_count: u32,
    /// Logical clock value of the last touch, for LRU ordering.
    pub(crate) touched: u64,
}

impl Session {
    pub(crate) fn new(key: SessionKey, now: Instant, tick: u64) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            key,
            created_at: Utc::now(),
            last_used_at: now,
            conversation: None,
            model: None,
            message_count: 0,
            touched: tick,
        }
    }

    pub(crate) fn touch(&mut self, now: Instant, tick: u64) {
        self.last_used_at = now;
        self.touched = tick;
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }
}

/// Listing entry returned by [`SessionStore::list`](crate::SessionStore::list).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub message_count: u32,
    pub model: Option<String>,
    pub has_conversation: bool,
    pub is_active: bool,
}

/// Aggregate counters for status output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub sessions: usize,
    pub users: usize,
    pub created: u64,
    pub expired: u64,
    pub evicted: u64,
    pub pinned: usize,
}
