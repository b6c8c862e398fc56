//! Linked account storage
//!
//! Credentials live in `accounts`, one row per (user, provider).

use async_trait::async_trait;
use chrono::Utc;
use cued_common::{Error, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::credentials::{Credential, CredentialStore};
use crate::utils::db_retry::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

/// Provider id of Spotify-linked accounts
pub const SPOTIFY_PROVIDER: &str = "spotify";

pub struct SqliteCredentialStore {
    pool: SqlitePool,
    provider_id: String,
}

impl SqliteCredentialStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self::for_provider(pool, SPOTIFY_PROVIDER)
    }

    pub fn for_provider(pool: SqlitePool, provider_id: impl Into<String>) -> Self {
        Self {
            pool,
            provider_id: provider_id.into(),
        }
    }

    /// Link (or relink) a user's account; returns the account id
    pub async fn link_account(
        &self,
        user_id: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: chrono::DateTime<Utc>,
    ) -> Result<String> {
        let new_id = Uuid::new_v4().to_string();
        let expires_at = expires_at.to_rfc3339();

        retry_on_lock("link_account", DEFAULT_MAX_LOCK_WAIT_MS, || async {
            sqlx::query(
                r#"
                INSERT INTO accounts (
                    account_id, user_id, provider_id, access_token, refresh_token,
                    access_token_expires_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
                ON CONFLICT(user_id, provider_id) DO UPDATE SET
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token,
                    access_token_expires_at = excluded.access_token_expires_at,
                    updated_at = CURRENT_TIMESTAMP
                "#,
            )
            .bind(&new_id)
            .bind(user_id)
            .bind(&self.provider_id)
            .bind(access_token)
            .bind(refresh_token)
            .bind(&expires_at)
            .execute(&self.pool)
            .await
            .map_err(Error::from)
        })
        .await?;

        let account_id: String =
            sqlx::query_scalar("SELECT account_id FROM accounts WHERE user_id = ? AND provider_id = ?")
                .bind(user_id)
                .bind(&self.provider_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(account_id)
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn load(&self, user_id: &str) -> Result<Option<Credential>> {
        let row = sqlx::query(
            r#"
            SELECT account_id, access_token, refresh_token, access_token_expires_at
            FROM accounts
            WHERE user_id = ? AND provider_id = ?
            "#,
        )
        .bind(user_id)
        .bind(&self.provider_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let expires_at: String = row.get("access_token_expires_at");
            Ok(Credential {
                access_token: row.get("access_token"),
                refresh_token: row.get("refresh_token"),
                expires_at: cued_common::time::parse_rfc3339(&expires_at)?,
                account_ref: row.get("account_id"),
            })
        })
        .transpose()
    }

    async fn save(&self, user_id: &str, credential: &Credential) -> Result<()> {
        let expires_at = credential.expires_at.to_rfc3339();

        let result = retry_on_lock("save_credential", DEFAULT_MAX_LOCK_WAIT_MS, || async {
            sqlx::query(
                r#"
                UPDATE accounts
                SET access_token = ?, refresh_token = ?, access_token_expires_at = ?,
                    updated_at = CURRENT_TIMESTAMP
                WHERE account_id = ? AND user_id = ?
                "#,
            )
            .bind(&credential.access_token)
            .bind(&credential.refresh_token)
            .bind(&expires_at)
            .bind(&credential.account_ref)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(Error::from)
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!(
                "Account {} for user {}",
                credential.account_ref, user_id
            )));
        }

        tracing::debug!(user_id = %user_id, account = %credential.account_ref, "Credential saved");
        Ok(())
    }
}
