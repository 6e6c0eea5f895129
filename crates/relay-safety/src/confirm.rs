use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use relay_core::UserId;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::gate::RiskTier;

/// A risky command parked until the user answers the confirmation prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConfirmation {
    pub tier: RiskTier,
    pub command: String,
    pub created_at: Instant,
}

/// Result of looking up a user's pending confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    None,
    /// The prompt timed out; the entry has been removed.
    Expired,
    Pending(PendingConfirmation),
}

/// At most one outstanding confirmation per user, bounded overall.
///
/// Expiry is checked on access.  When the cap is reached the oldest entry
/// is dropped to make room.
pub struct ConfirmationStore {
    pending: Mutex<HashMap<UserId, PendingConfirmation>>,
    timeout: Duration,
    max_pending: usize,
}

impl ConfirmationStore {
    pub fn new(timeout: Duration, max_pending: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
            max_pending: max_pending.max(1),
        }
    }

    /// Park `command` for `user`, replacing any earlier entry.
    pub fn insert(&self, user: UserId, tier: RiskTier, command: String) {
        let mut pending = self.lock();
        if !pending.contains_key(&user) && pending.len() >= self.max_pending {
            let oldest = pending
                .iter()
                .min_by_key(|(_, p)| p.created_at)
                .map(|(id, _)| *id);
            if let Some(evicted) = oldest {
                pending.remove(&evicted);
                info!(user_id = %evicted, "evicted oldest pending confirmation");
            }
        }
        pending.insert(
            user,
            PendingConfirmation {
                tier,
                command,
                created_at: Instant::now(),
            },
        );
        debug!(user_id = %user, tier = %tier, total = pending.len(), "confirmation pending");
    }

    pub fn lookup(&self, user: UserId) -> Lookup {
        let mut pending = self.lock();
        match pending.get(&user) {
            None => Lookup::None,
            Some(p) if p.created_at.elapsed() > self.timeout => {
                pending.remove(&user);
                debug!(user_id = %user, "confirmation expired");
                Lookup::Expired
            }
            Some(p) => Lookup::Pending(p.clone()),
        }
    }

    pub fn remove(&self, user: UserId) -> Option<PendingConfirmation> {
        self.lock().remove(&user)
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.lock().contains_key(&user)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, PendingConfirmation>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}
