//! Thread-safe map of live sessions keyed by remote endpoint.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use super::session::{Session, SessionError};

pub struct SessionTable {
    sessions: Mutex<HashMap<SocketAddr, Arc<Session>>>,
    max_sessions: usize,
}

impl SessionTable {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions,
        }
    }

    /// Return the session for `endpoint`, creating it with `make` if absent.
    ///
    /// Lookup and insert happen under one lock, so concurrent callers for
    /// the same endpoint all receive the same session.
    pub fn create_session<F>(&self, endpoint: SocketAddr, make: F) -> Result<Arc<Session>, SessionError>
    where
        F: FnOnce() -> Session,
    {
        let mut sessions = self.sessions.lock();

        if let Some(existing) = sessions.get(&endpoint) {
            return Ok(Arc::clone(existing));
        }

        if sessions.len() >= self.max_sessions {
            return Err(SessionError::MaxSessionsExceeded {
                limit: self.max_sessions,
            });
        }

        let session = Arc::new(make());
        sessions.insert(endpoint, Arc::clone(&session));
        Ok(session)
    }

    pub fn get_session(&self, endpoint: &SocketAddr) -> Option<Arc<Session>> {
        self.sessions.lock().get(endpoint).cloned()
    }

    /// Remove `session` if it is still the one registered for its endpoint.
    ///
    /// A stale handle never evicts a newer session at the same endpoint.
    pub fn remove_session(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(&session.endpoint()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(&session.endpoint());
                true
            }
            _ => false,
        }
    }

    /// First live session bound to `player_id`.
    ///
    /// Only the sessions' atomics are read, so no session lock is taken
    /// while the table is held.
    pub fn find_session_by_player_id(&self, player_id: u64) -> Option<Arc<Session>> {
        if player_id == 0 {
            return None;
        }
        self.sessions
            .lock()
            .values()
            .find(|s| s.player_id() == player_id && !s.is_closed())
            .cloned()
    }

    /// Handles to every session, taken without holding the lock afterwards.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }
}
