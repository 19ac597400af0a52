//! Bounded sticky-session store.

use std::time::Duration;

use moka::sync::Cache;

use crate::constants;

/// Maps session identifiers to the server URL they are pinned to.
///
/// Bounded by entry count and idle time so abandoned sessions are evicted
/// instead of accumulating for the life of the process.
pub struct SessionStore {
    bindings: Cache<String, String>,
}

impl SessionStore {
    /// Create a store with the default capacity and idle eviction.
    pub fn new() -> Self {
        Self::with_limits(
            constants::SESSION_CACHE_CAPACITY,
            Duration::from_secs(constants::SESSION_IDLE_SECS),
        )
    }

    /// Create a store with explicit bounds.
    pub fn with_limits(max_sessions: u64, idle_timeout: Duration) -> Self {
        Self {
            bindings: Cache::builder()
                .max_capacity(max_sessions)
                .time_to_idle(idle_timeout)
                .build(),
        }
    }

    /// Server URL pinned for a session, if any.
    pub fn get(&self, session_id: &str) -> Option<String> {
        self.bindings.get(session_id)
    }

    /// Pin a session to a server.
    pub fn bind(&self, session_id: &str, server_url: &str) {
        self.bindings
            .insert(session_id.to_string(), server_url.to_string());
    }

    /// Drop a session binding (e.g. its server left the roster).
    pub fn unbind(&self, session_id: &str) {
        self.bindings.invalidate(session_id);
    }

    /// Number of live bindings.
    pub fn len(&self) -> u64 {
        self.bindings.run_pending_tasks();
        self.bindings.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
