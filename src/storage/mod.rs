//! User profile storage.
//!
//! Profiles are created on a user's first local login and touched on every later
//! one. The store is injected behind [`UserProfileStore`]; profile trouble is logged
//! by callers and never blocks a sign-in.

pub mod memory;
#[cfg(feature = "postgres-storage")]
pub mod postgres;

pub use memory::MemoryProfileStore;
#[cfg(feature = "postgres-storage")]
pub use postgres::PostgresProfileStore;

use crate::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity provider recorded for profiles created by the local credential login.
pub const LOCAL_IDENTITY_PROVIDER: &str = "SimpleAuth";

/// Application-side record about a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub display_name: String,
    pub email: String,
    pub phone_number: String,
    pub preferred_storage_type: String,
    pub identity_provider: String,
    pub is_migrated: bool,
    pub migration_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_login_at: DateTime<Utc>,
}

impl UserProfile {
    /// Profile for a user seen for the first time.
    pub fn new(user_id: impl Into<String>, email: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let now = Utc::now();
        Self {
            display_name: user_id.clone(),
            user_id,
            email: email.into(),
            phone_number: String::new(),
            preferred_storage_type: String::new(),
            identity_provider: LOCAL_IDENTITY_PROVIDER.to_string(),
            is_migrated: true,
            migration_date: Some(now),
            created_at: now,
            last_login_at: now,
        }
    }

    pub fn with_identity_provider(mut self, provider: impl Into<String>) -> Self {
        self.identity_provider = provider.into();
        self
    }
}

/// Storage backend for user profiles.
#[async_trait]
pub trait UserProfileStore: Send + Sync {
    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>>;

    /// Insert or replace a profile.
    async fn save_profile(&self, profile: &UserProfile) -> Result<()>;

    /// Stamp the last login time; a missing profile is not an error.
    async fn update_last_login(&self, user_id: &str) -> Result<()>;
}

/// Make sure a profile exists for a local login, returning whether it was created.
pub async fn ensure_profile(
    store: &dyn UserProfileStore,
    user_id: &str,
    email: &str,
) -> Result<bool> {
    match store.get_profile(user_id).await? {
        None => {
            store.save_profile(&UserProfile::new(user_id, email)).await?;
            tracing::info!(user_id, "Created new user profile");
            Ok(true)
        }
        Some(mut profile) => {
            if profile.email.is_empty() {
                profile.email = email.to_string();
                store.save_profile(&profile).await?;
                tracing::info!(user_id, "Filled in missing profile email");
            }
            store.update_last_login(user_id).await?;
            Ok(false)
        }
    }
}
