use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use relay_core::config::SessionsConfig;
use relay_core::UserId;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::error::{Result, SessionError};
use crate::types::{Session, SessionInfo, SessionKey, SessionStats};

/// In-memory, bounded store of per-user sessions.
///
/// All state sits behind one `Mutex` that is only held for short,
/// non-suspending sections, so a global LRU scan never blocks across I/O.
/// Expiry is checked lazily when a session is resolved; there is no
/// background sweep.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Mutex<Inner>>,
    config: Arc<SessionsConfig>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<UserId, UserSessions>,
    total: usize,
    clock: u64,
    pins: HashMap<SessionKey, usize>,
    created: u64,
    expired: u64,
    evicted: u64,
}

struct UserSessions {
    sessions: HashMap<String, Session>,
    active: String,
}

impl SessionStore {
    pub fn new(config: SessionsConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &SessionsConfig {
        &self.config
    }

    /// Fetch-or-create `name` (the user's active session when `None`) and
    /// mark it used.
    ///
    /// A session idle for longer than the expiry window is replaced by a
    /// fresh one under the same name; its conversation handle is dropped.
    #[instrument(skip(self), fields(user_id = %user))]
    pub fn resolve(&self, user: UserId, name: Option<&str>) -> Result<Session> {
        let mut inner = self.lock();
        let name = match name {
            Some(n) => n.to_string(),
            None => inner.active_name(user, &self.config.default_name),
        };
        self.validate_name(&name)?;

        let now = Instant::now();
        let tick = inner.tick();
        let expiry = self.config.expiry();
        if let Some(session) = inner.get_mut(user, &name) {
            if now.duration_since(session.last_used_at) > expiry {
                let key = session.key.clone();
                *session = Session::new(key, now, tick);
                let fresh = session.clone();
                inner.expired += 1;
                info!(session = %name, "session expired, starting fresh");
                return Ok(fresh);
            }
            session.touch(now, tick);
            debug!(session = %name, "session hit");
            return Ok(session.clone());
        }

        inner.insert_new(user, name, now, tick, &self.config)
    }

    /// Create a session and make it active.  `None` picks `session-N`.
    #[instrument(skip(self), fields(user_id = %user))]
    pub fn create(&self, user: UserId, name: Option<&str>) -> Result<Session> {
        let mut inner = self.lock();
        let name = match name {
            Some(n) => {
                self.validate_name(n)?;
                n.to_string()
            }
            None => inner.auto_name(user),
        };
        if inner.get_mut(user, &name).is_some() {
            return Err(SessionError::AlreadyExists { name });
        }

        let now = Instant::now();
        let tick = inner.tick();
        let session = inner.insert_new(user, name.clone(), now, tick, &self.config)?;
        if let Some(us) = inner.users.get_mut(&user) {
            us.active = name;
        }
        Ok(session)
    }

    /// Make an existing session the active one.
    pub fn switch(&self, user: UserId, name: &str) -> Result<Session> {
        let mut inner = self.lock();
        let now = Instant::now();
        let tick = inner.tick();
        let us = inner
            .users
            .get_mut(&user)
            .filter(|us| us.sessions.contains_key(name))
            .ok_or_else(|| SessionError::NotFound {
                name: name.to_string(),
            })?;
        us.active = name.to_string();
        let session = us
            .sessions
            .get_mut(name)
            .ok_or_else(|| SessionError::NotFound {
                name: name.to_string(),
            })?;
        session.touch(now, tick);
        Ok(session.clone())
    }

    pub fn rename(&self, user: UserId, old: &str, new: &str) -> Result<()> {
        self.validate_name(new)?;
        let mut inner = self.lock();
        if inner.is_pinned(&SessionKey::new(user, old)) {
            return Err(SessionError::Busy {
                name: old.to_string(),
            });
        }
        let us = inner
            .users
            .get_mut(&user)
            .ok_or_else(|| SessionError::NotFound {
                name: old.to_string(),
            })?;
        if us.sessions.contains_key(new) {
            return Err(SessionError::AlreadyExists {
                name: new.to_string(),
            });
        }
        let mut session = us
            .sessions
            .remove(old)
            .ok_or_else(|| SessionError::NotFound {
                name: old.to_string(),
            })?;
        session.key.name = new.to_string();
        us.sessions.insert(new.to_string(), session);
        if us.active == old {
            us.active = new.to_string();
        }
        info!(user_id = %user, from = %old, to = %new, "session renamed");
        Ok(())
    }

    /// Remove a session.  If it was active, the most recently used remaining
    /// session (or the default name) becomes active.
    pub fn delete(&self, user: UserId, name: &str) -> Result<()> {
        let mut inner = self.lock();
        if inner.is_pinned(&SessionKey::new(user, name)) {
            return Err(SessionError::Busy {
                name: name.to_string(),
            });
        }
        let us = inner
            .users
            .get_mut(&user)
            .ok_or_else(|| SessionError::NotFound {
                name: name.to_string(),
            })?;
        if us.sessions.remove(name).is_none() {
            return Err(SessionError::NotFound {
                name: name.to_string(),
            });
        }
        if us.active == name {
            us.active = us
                .sessions
                .values()
                .max_by_key(|s| s.touched)
                .map(|s| s.key.name.clone())
                .unwrap_or_else(|| self.config.default_name.clone());
        }
        let now_empty = us.sessions.is_empty();
        inner.total -= 1;
        if now_empty {
            inner.users.remove(&user);
        }
        info!(user_id = %user, session = %name, "session deleted");
        Ok(())
    }

    /// Sessions of `user`, most recently used first.
    pub fn list(&self, user: UserId) -> Vec<SessionInfo> {
        let inner = self.lock();
        let Some(us) = inner.users.get(&user) else {
            return Vec::new();
        };
        let mut sessions: Vec<&Session> = us.sessions.values().collect();
        sessions.sort_by(|a, b| b.touched.cmp(&a.touched));
        sessions
            .into_iter()
            .map(|s| SessionInfo {
                name: s.key.name.clone(),
                created_at: s.created_at,
                idle_secs: s.last_used_at.elapsed().as_secs(),
                message_count: s.message_count,
                model: s.model.clone(),
                has_conversation: s.conversation.is_some(),
                is_active: s.key.name == us.active,
            })
            .collect()
    }

    pub fn active_name(&self, user: UserId) -> String {
        self.lock().active_name(user, &self.config.default_name)
    }

    /// Store the backend conversation handle after a completed request.
    pub fn record_turn(&self, key: &SessionKey, conversation: Option<String>) {
        let mut inner = self.lock();
        if let Some(session) = inner.get_mut(key.user, &key.name) {
            session.message_count += 1;
            if conversation.is_some() {
                session.conversation = conversation;
            }
        }
    }

    /// Forget the backend conversation of the active session.
    pub fn clear(&self, user: UserId) -> Option<String> {
        let mut inner = self.lock();
        let name = inner.active_name(user, &self.config.default_name);
        let session = inner.get_mut(user, &name)?;
        session.conversation = None;
        session.message_count = 0;
        Some(name)
    }

    /// Set the model for the active session, creating it if needed.
    pub fn set_model(&self, user: UserId, model: Option<String>) -> Result<Session> {
        let session = self.resolve(user, None)?;
        let mut inner = self.lock();
        let stored = inner
            .get_mut(user, session.name())
            .ok_or_else(|| SessionError::NotFound {
                name: session.key.name.clone(),
            })?;
        stored.model = model;
        Ok(stored.clone())
    }

    /// Protect a session from eviction, deletion and renaming until the
    /// guard is dropped.
    pub fn pin(&self, key: SessionKey) -> PinGuard {
        *self.lock().pins.entry(key.clone()).or_insert(0) += 1;
        PinGuard {
            inner: Arc::clone(&self.inner),
            key,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().total
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn user_count(&self, user: UserId) -> usize {
        self.lock()
            .users
            .get(&user)
            .map(|us| us.sessions.len())
            .unwrap_or(0)
    }

    pub fn contains(&self, user: UserId, name: &str) -> bool {
        self.lock()
            .users
            .get(&user)
            .is_some_and(|us| us.sessions.contains_key(name))
    }

    pub fn stats(&self) -> SessionStats {
        let inner = self.lock();
        SessionStats {
            sessions: inner.total,
            users: inner.users.len(),
            created: inner.created,
            expired: inner.expired,
            evicted: inner.evicted,
            pinned: inner.pins.len(),
        }
    }

    fn validate_name(&self, name: &str) -> Result<()> {
        if name.chars().count() > self.config.name_max_len {
            return Err(SessionError::NameTooLong {
                max: self.config.name_max_len,
            });
        }
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(SessionError::InvalidName {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn active_name(&self, user: UserId, default: &str) -> String {
        self.users
            .get(&user)
            .map(|us| us.active.clone())
            .unwrap_or_else(|| default.to_string())
    }

    fn get_mut(&mut self, user: UserId, name: &str) -> Option<&mut Session> {
        self.users.get_mut(&user)?.sessions.get_mut(name)
    }

    fn is_pinned(&self, key: &SessionKey) -> bool {
        self.pins.contains_key(key)
    }

    fn auto_name(&self, user: UserId) -> String {
        let existing = self.users.get(&user);
        let mut n = existing.map(|us| us.sessions.len()).unwrap_or(0) + 1;
        loop {
            let candidate = format!("session-{n}");
            if !existing.is_some_and(|us| us.sessions.contains_key(&candidate)) {
                return candidate;
            }
            n += 1;
        }
    }

    fn insert_new(
        &mut self,
        user: UserId,
        name: String,
        now: Instant,
        tick: u64,
        config: &SessionsConfig,
    ) -> Result<Session> {
        self.make_room(user, config)?;

        let session = Session::new(SessionKey::new(user, name.clone()), now, tick);
        let us = self.users.entry(user).or_insert_with(|| UserSessions {
            sessions: HashMap::new(),
            active: name.clone(),
        });
        us.sessions.insert(name.clone(), session.clone());
        self.total += 1;
        self.created += 1;
        debug!(user_id = %user, session = %name, total = self.total, "session created");
        Ok(session)
    }

    /// Evict until one more session fits: the user's own LRU first, then the
    /// global LRU.  Pinned sessions are never chosen.
    fn make_room(&mut self, user: UserId, config: &SessionsConfig) -> Result<()> {
        while self
            .users
            .get(&user)
            .is_some_and(|us| us.sessions.len() >= config.max_per_user)
        {
            let victim = self
                .lru_candidate(Some(user))
                .ok_or(SessionError::LimitExceeded {
                    limit: config.max_per_user,
                })?;
            self.evict(victim);
        }

        while self.total >= config.max_total {
            let victim = self
                .lru_candidate(None)
                .ok_or(SessionError::LimitExceeded {
                    limit: config.max_total,
                })?;
            self.evict(victim);
        }
        Ok(())
    }

    fn lru_candidate(&self, only: Option<UserId>) -> Option<SessionKey> {
        self.users
            .iter()
            .filter(|(id, _)| only.map_or(true, |u| u == **id))
            .flat_map(|(_, us)| us.sessions.values())
            .filter(|s| !self.is_pinned(&s.key))
            .min_by_key(|s| s.touched)
            .map(|s| s.key.clone())
    }

    fn evict(&mut self, key: SessionKey) {
        let Some(us) = self.users.get_mut(&key.user) else {
            return;
        };
        if us.sessions.remove(&key.name).is_none() {
            return;
        }
        let now_empty = us.sessions.is_empty();
        self.total -= 1;
        self.evicted += 1;
        if now_empty {
            self.users.remove(&key.user);
        }
        info!(key = %key, "session evicted (LRU)");
    }
}

/// Keeps a session pinned while alive.
pub struct PinGuard {
    inner: Arc<Mutex<Inner>>,
    key: SessionKey,
}

impl PinGuard {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = inner.pins.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                inner.pins.remove(&self.key);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
