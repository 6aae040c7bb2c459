//! Server-side session state.
//!
//! A session is a small string key/value bag scoped to one browser session. The
//! simulated identity provider reads its record from here, the federated scheme
//! keeps its correlation data here, and one-shot user messages travel through it
//! between a redirect and the page that shows them.

pub mod memory;

pub use memory::MemorySessionStore;

use crate::errors::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Session key holding the simulated provider tag.
pub const SIMULATED_PROVIDER_KEY: &str = "SimulatedAuthProvider";

/// Session key holding the simulated user id.
pub const SIMULATED_USER_ID_KEY: &str = "SimulatedUserId";

/// Session key holding a one-shot message for the login page.
pub const ERROR_MESSAGE_KEY: &str = "ErrorMessage";

/// Trait for session storage backends.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Read a value from a session.
    async fn get(&self, session_id: &str, key: &str) -> Result<Option<String>>;

    /// Write a value into a session, creating the session if needed.
    async fn set(&self, session_id: &str, key: &str, value: &str) -> Result<()>;

    /// Remove a single value from a session.
    async fn remove(&self, session_id: &str, key: &str) -> Result<()>;

    /// Drop every value of a session.
    async fn clear(&self, session_id: &str) -> Result<()>;

    /// Evict idle sessions, returning how many were removed.
    async fn cleanup_expired(&self) -> Result<usize>;
}

/// Handle to one browser session: its id plus the store that backs it.
#[derive(Clone)]
pub struct Session {
    id: String,
    store: Arc<dyn SessionStore>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

impl Session {
    pub fn new(id: impl Into<String>, store: Arc<dyn SessionStore>) -> Self {
        Self {
            id: id.into(),
            store,
        }
    }

    /// Start a session with a fresh random id.
    pub fn generate(store: Arc<dyn SessionStore>) -> Self {
        Self::new(uuid::Uuid::new_v4().simple().to_string(), store)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn get_string(&self, key: &str) -> Result<Option<String>> {
        self.store.get(&self.id, key).await
    }

    pub async fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.store.set(&self.id, key, value).await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.store.remove(&self.id, key).await
    }

    /// Read a value and remove it in one go.
    pub async fn take(&self, key: &str) -> Result<Option<String>> {
        let value = self.get_string(key).await?;
        if value.is_some() {
            self.remove(key).await?;
        }
        Ok(value)
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.clear(&self.id).await
    }
}

/// Simulated login state kept in the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationRecord {
    provider: String,
    user_id: Option<String>,
}

impl SimulationRecord {
    /// Returns `None` when the provider tag is empty.
    pub fn new(provider: impl Into<String>, user_id: Option<String>) -> Option<Self> {
        let provider = provider.into();
        if provider.trim().is_empty() {
            return None;
        }
        Some(Self {
            provider,
            user_id: user_id.filter(|id| !id.is_empty()),
        })
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Load the record from a session; an empty provider slot means no record.
    pub async fn load(session: &Session) -> Result<Option<Self>> {
        let Some(provider) = session.get_string(SIMULATED_PROVIDER_KEY).await? else {
            return Ok(None);
        };
        let user_id = session.get_string(SIMULATED_USER_ID_KEY).await?;
        Ok(Self::new(provider, user_id))
    }

    pub async fn save(&self, session: &Session) -> Result<()> {
        session
            .set_string(SIMULATED_PROVIDER_KEY, &self.provider)
            .await?;
        match &self.user_id {
            Some(user_id) => session.set_string(SIMULATED_USER_ID_KEY, user_id).await,
            None => session.remove(SIMULATED_USER_ID_KEY).await,
        }
    }

    /// Remove the record from a session.
    pub async fn clear(session: &Session) -> Result<()> {
        session.remove(SIMULATED_PROVIDER_KEY).await?;
        session.remove(SIMULATED_USER_ID_KEY).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("s1", Arc::new(MemorySessionStore::new()))
    }

    #[test]
    fn test_record_requires_provider() {
        assert!(SimulationRecord::new("", None).is_none());
        assert!(SimulationRecord::new("   ", Some("u".into())).is_none());
        let record = SimulationRecord::new("aad", Some(String::new())).unwrap();
        assert_eq!(record.user_id(), None);
    }

    #[tokio::test]
    async fn test_record_roundtrip_and_clear() {
        let session = session();
        let record = SimulationRecord::new("google", Some("google_user_1".into())).unwrap();
        record.save(&session).await.unwrap();

        let loaded = SimulationRecord::load(&session).await.unwrap();
        assert_eq!(loaded, Some(record));

        SimulationRecord::clear(&session).await.unwrap();
        assert_eq!(SimulationRecord::load(&session).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_take_removes_value() {
        let session = session();
        session.set_string(ERROR_MESSAGE_KEY, "nope").await.unwrap();
        assert_eq!(
            session.take(ERROR_MESSAGE_KEY).await.unwrap().as_deref(),
            Some("nope")
        );
        assert_eq!(session.take(ERROR_MESSAGE_KEY).await.unwrap(), None);
    }
}
