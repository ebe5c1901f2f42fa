//! Session-to-user directory and per-session broadcast cursors.
//!
//! A session is created the first time a `hello` resolves its identifier
//! against the datastore and lives for the rest of the process; connections
//! come and go underneath it. Each session remembers, per user, the last
//! version it has been sent (its cursor), which is what makes the broadcast
//! differential.

use std::collections::HashMap;
use std::time::Instant;

use log::info;

/// One authenticated session: the user it belongs to plus its view of the
/// world, expressed as seen-version cursors.
#[derive(Debug)]
pub struct Session {
    pub user_id: i64,
    /// user id -> last version delivered to this session.
    seen_versions: HashMap<i64, u64>,
    pub last_activity: Instant,
}

/// Process-lifetime cache of session bindings. Entries are never evicted;
/// a restart clears them.
#[derive(Debug, Default)]
pub struct SessionDirectory {
    sessions: HashMap<String, Session>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// In-memory resolution only. A miss here means the caller must go
    /// through the datastore, which only `hello` is allowed to trigger.
    pub fn resolve(&self, session_id: &str) -> Option<i64> {
        self.sessions.get(session_id).map(|s| s.user_id)
    }

    /// Records a datastore-confirmed session binding.
    pub fn bind(&mut self, session_id: &str, user_id: i64) {
        info!("Session {} bound to user {}", session_id, user_id);
        self.sessions.insert(
            session_id.to_string(),
            Session {
                user_id,
                seen_versions: HashMap::new(),
                last_activity: Instant::now(),
            },
        );
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// The session's cursor for a user; zero when nothing was delivered yet.
    pub fn seen_version(&self, session_id: &str, user_id: i64) -> u64 {
        self.sessions
            .get(session_id)
            .and_then(|s| s.seen_versions.get(&user_id))
            .copied()
            .unwrap_or(0)
    }

    /// Advances the session's cursor after a `user_data` send.
    pub fn record_seen(&mut self, session_id: &str, user_id: i64, version: u64) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.seen_versions.insert(user_id, version);
        }
    }

    /// `refresh`: drop every cursor so the next broadcast tick resends the
    /// whole world to this session.
    pub fn reset(&mut self, session_id: &str) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.seen_versions.clear();
        }
    }

    /// Records liveness on `pong`.
    pub fn touch(&mut self, session_id: &str) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.last_activity = Instant::now();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
