//! In-memory profile store backed by `DashMap`.

use super::{UserProfile, UserProfileStore};
use crate::errors::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// Process-local profile store. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryProfileStore {
    profiles: Arc<DashMap<String, UserProfile>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[async_trait]
impl UserProfileStore for MemoryProfileStore {
    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        tracing::debug!(user_id, "Retrieving user profile");
        // Clone out so no shard guard lives across an await.
        Ok(self.profiles.get(user_id).map(|p| p.value().clone()))
    }

    async fn save_profile(&self, profile: &UserProfile) -> Result<()> {
        tracing::debug!(user_id = %profile.user_id, "Saving user profile");
        self.profiles
            .insert(profile.user_id.clone(), profile.clone());
        Ok(())
    }

    async fn update_last_login(&self, user_id: &str) -> Result<()> {
        if let Some(mut profile) = self.profiles.get_mut(user_id) {
            profile.last_login_at = chrono::Utc::now();
        }
        Ok(())
    }
}
