//! In-memory session store backed by DashMap.
//!
//! Sessions expire after an idle timeout. Reads refresh the idle clock, so an
//! active browser keeps its session alive. Never hold a DashMap reference across
//! an await point: every operation extracts what it needs and drops the guard.

use crate::errors::Result;
use crate::session::SessionStore;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Default idle timeout for sessions.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
struct SessionEntry {
    values: HashMap<String, String>,
    last_access: Instant,
}

impl SessionEntry {
    fn new() -> Self {
        Self {
            values: HashMap::new(),
            last_access: Instant::now(),
        }
    }

    fn is_expired(&self, idle_timeout: Duration, now: Instant) -> bool {
        now.duration_since(self.last_access) > idle_timeout
    }
}

/// In-memory session storage (development, tests, single-instance deployments).
#[derive(Debug, Clone)]
pub struct MemorySessionStore {
    sessions: Arc<DashMap<String, SessionEntry>>,
    idle_timeout: Duration,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::with_idle_timeout(DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            idle_timeout,
        }
    }

    /// Number of live sessions, expired ones included until the next sweep.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Periodically evict idle sessions. Must be called from within a Tokio runtime.
    pub fn spawn_cleanup(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = store.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "Evicted idle sessions");
                }
            }
        })
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions
            .retain(|_, entry| !entry.is_expired(self.idle_timeout, now));
        before.saturating_sub(self.sessions.len())
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, session_id: &str, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let expired = match self.sessions.get_mut(session_id) {
            Some(mut entry) => {
                if entry.is_expired(self.idle_timeout, now) {
                    true
                } else {
                    entry.last_access = now;
                    return Ok(entry.values.get(key).cloned());
                }
            }
            None => return Ok(None),
        };

        if expired {
            self.sessions.remove(session_id);
        }
        Ok(None)
    }

    async fn set(&self, session_id: &str, key: &str, value: &str) -> Result<()> {
        let now = Instant::now();
        let mut entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionEntry::new);
        if entry.is_expired(self.idle_timeout, now) {
            entry.values.clear();
        }
        entry.last_access = now;
        entry.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, session_id: &str, key: &str) -> Result<()> {
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            entry.values.remove(key);
        }
        Ok(())
    }

    async fn clear(&self, session_id: &str) -> Result<()> {
        self.sessions.remove(session_id);
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        Ok(self.sweep())
    }
}
