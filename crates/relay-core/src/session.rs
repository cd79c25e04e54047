use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::{config::SessionConfig, domain::SessionId};

/// Per-session switches owned by the session-status / whitelist stages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionState {
    /// The bot responds in this session.
    pub enabled: bool,
    /// Whitelisted at runtime (in addition to configured entries).
    pub whitelisted: bool,
    pub last_activity: Option<DateTime<Utc>>,
}

impl SessionState {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            whitelisted: false,
            last_activity: None,
        }
    }
}

/// Arena of session state plus per-session pipeline run locks.
///
/// State is looked up by id and edited in place under that session's lock;
/// different sessions never contend on each other's lock.
pub struct SessionStore {
    default_enabled: bool,
    /// When non-empty, only these sessions start enabled.
    enabled_sessions: HashSet<SessionId>,
    states: Mutex<HashMap<SessionId, Arc<Mutex<SessionState>>>>,
    run_locks: Mutex<HashMap<SessionId, Arc<AsyncMutex<()>>>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(&SessionConfig::default())
    }
}

impl SessionStore {
    pub fn new(cfg: &SessionConfig) -> Self {
        Self {
            default_enabled: cfg.default_enabled,
            enabled_sessions: cfg
                .enabled_sessions
                .iter()
                .map(|s| SessionId(s.clone()))
                .collect(),
            states: Mutex::new(HashMap::new()),
            run_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Status a session has before anyone toggles it.
    fn starts_enabled(&self, session: &SessionId) -> bool {
        if self.enabled_sessions.is_empty() {
            self.default_enabled
        } else {
            self.enabled_sessions.contains(session)
        }
    }

    fn entry(&self, session: &SessionId) -> Arc<Mutex<SessionState>> {
        let mut map = self.states.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(session.clone())
            .or_insert_with(|| Arc::new(Mutex::new(SessionState::new(self.starts_enabled(session)))))
            .clone()
    }

    /// Run `f` against the session's state under its lock.
    pub fn with_state<T>(&self, session: &SessionId, f: impl FnOnce(&mut SessionState) -> T) -> T {
        let state = self.entry(session);
        let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn is_enabled(&self, session: &SessionId) -> bool {
        self.with_state(session, |s| s.enabled)
    }

    pub fn set_enabled(&self, session: &SessionId, enabled: bool) {
        self.with_state(session, |s| s.enabled = enabled);
    }

    pub fn is_whitelisted(&self, session: &SessionId) -> bool {
        self.with_state(session, |s| s.whitelisted)
    }

    pub fn set_whitelisted(&self, session: &SessionId, whitelisted: bool) {
        self.with_state(session, |s| s.whitelisted = whitelisted);
    }

    pub fn touch(&self, session: &SessionId, at: DateTime<Utc>) {
        self.with_state(session, |s| s.last_activity = Some(at));
    }

    pub fn last_activity(&self, session: &SessionId) -> Option<DateTime<Utc>> {
        self.with_state(session, |s| s.last_activity)
    }

    /// Serialize whole pipeline runs per session (conversational ordering).
    pub async fn lock_session(&self, session: &SessionId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.run_locks.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(session.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop what the store keeps for an idle session: its run lock when
    /// nobody holds or waits on it, and its state when it matches what a
    /// fresh session would get.
    pub fn release(&self, session: &SessionId) {
        {
            let mut locks = self.run_locks.lock().unwrap_or_else(|e| e.into_inner());
            if locks.get(session).is_some_and(|l| Arc::strong_count(l) == 1) {
                locks.remove(session);
            }
        }

        let fresh = self.starts_enabled(session);
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let unchanged = states.get(session).is_some_and(|s| {
            if Arc::strong_count(s) > 1 {
                return false;
            }
            let s = s.lock().unwrap_or_else(|e| e.into_inner());
            s.enabled == fresh && !s.whitelisted
        });
        if unchanged {
            states.remove(session);
        }
    }

    /// Number of sessions with state or a run lock.
    pub fn tracked(&self) -> usize {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let locks = self.run_locks.lock().unwrap_or_else(|e| e.into_inner());
        states.keys().chain(locks.keys()).collect::<HashSet<_>>().len()
    }
}
