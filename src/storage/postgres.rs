/// PostgreSQL profile store.
use super::{UserProfile, UserProfileStore};
use crate::errors::{AuthError, Result, StorageError};
use async_trait::async_trait;
use sqlx::{PgPool, Row};

/// PostgreSQL-backed user profile store
pub struct PostgresProfileStore {
    pool: PgPool,
}

fn storage_error(context: &str, e: sqlx::Error) -> AuthError {
    AuthError::Storage(StorageError::operation_failed(format!("{context}: {e}")))
}

impl PostgresProfileStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` with a small pool.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await.map_err(|e| {
            AuthError::Storage(StorageError::connection_failed(e.to_string()))
        })?;
        Ok(Self::new(pool))
    }

    /// Create the profile table if it does not exist yet
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_profiles (
                user_id VARCHAR(255) PRIMARY KEY,
                display_name VARCHAR(255) NOT NULL,
                email VARCHAR(255) NOT NULL,
                phone_number VARCHAR(64) NOT NULL DEFAULT '',
                preferred_storage_type VARCHAR(64) NOT NULL DEFAULT '',
                identity_provider VARCHAR(64) NOT NULL,
                is_migrated BOOLEAN NOT NULL DEFAULT FALSE,
                migration_date TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                last_login_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error("Migration failed", e))?;

        Ok(())
    }
}

#[async_trait]
impl UserProfileStore for PostgresProfileStore {
    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, display_name, email, phone_number, preferred_storage_type,
                   identity_provider, is_migrated, migration_date, created_at, last_login_at
            FROM user_profiles WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("Failed to load profile", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let read = |e| storage_error("Failed to decode profile", e);
        Ok(Some(UserProfile {
            user_id: row.try_get("user_id").map_err(read)?,
            display_name: row.try_get("display_name").map_err(read)?,
            email: row.try_get("email").map_err(read)?,
            phone_number: row.try_get("phone_number").map_err(read)?,
            preferred_storage_type: row.try_get("preferred_storage_type").map_err(read)?,
            identity_provider: row.try_get("identity_provider").map_err(read)?,
            is_migrated: row.try_get("is_migrated").map_err(read)?,
            migration_date: row.try_get("migration_date").map_err(read)?,
            created_at: row.try_get("created_at").map_err(read)?,
            last_login_at: row.try_get("last_login_at").map_err(read)?,
        }))
    }

    async fn save_profile(&self, profile: &UserProfile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_profiles (
                user_id, display_name, email, phone_number, preferred_storage_type,
                identity_provider, is_migrated, migration_date, created_at, last_login_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (user_id) DO UPDATE SET
                display_name = EXCLUDED.display_name,
                email = EXCLUDED.email,
                phone_number = EXCLUDED.phone_number,
                preferred_storage_type = EXCLUDED.preferred_storage_type,
                identity_provider = EXCLUDED.identity_provider,
                is_migrated = EXCLUDED.is_migrated,
                migration_date = EXCLUDED.migration_date,
                last_login_at = EXCLUDED.last_login_at
            "#,
        )
        .bind(&profile.user_id)
        .bind(&profile.display_name)
        .bind(&profile.email)
        .bind(&profile.phone_number)
        .bind(&profile.preferred_storage_type)
        .bind(&profile.identity_provider)
        .bind(profile.is_migrated)
        .bind(profile.migration_date)
        .bind(profile.created_at)
        .bind(profile.last_login_at)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error("Failed to save profile", e))?;

        Ok(())
    }

    async fn update_last_login(&self, user_id: &str) -> Result<()> {
        sqlx::query("UPDATE user_profiles SET last_login_at = NOW() WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error("Failed to update last login", e))?;
        Ok(())
    }
}
