//! Credential lifecycle
//!
//! Each scheduler owns one [`ManagedCredential`]. Refresh attempts are spaced
//! by a cooldown: a remote failure inside the cooldown window is fatal, and a
//! failed refresh exchange is never retried.

pub mod token_client;

pub use token_client::SpotifyTokenClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cued_common::events::{EventBus, SessionEvent};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::playback::PlaybackError;

/// Bearer credential for one linked account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    /// Store key of the account row the credential belongs to
    pub account_ref: String,
}

impl Credential {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("No linked account for user {0}")]
    NotFound(String),

    #[error("Refresh cooldown active: last attempt {since_last_attempt_ms} ms ago, cooldown {cooldown_ms} ms")]
    CooldownActive {
        since_last_attempt_ms: u64,
        cooldown_ms: u64,
    },

    #[error("Token exchange failed ({0}): {1}")]
    Exchange(u16, String),

    #[error("Token endpoint unreachable: {0}")]
    Network(String),

    #[error("Token response malformed: {0}")]
    Parse(String),

    #[error("Credential store error: {0}")]
    Store(#[from] cued_common::Error),
}

/// Result of a refresh-token exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Lifetime in seconds
    pub expires_in: u64,
    /// Present when the provider rotates refresh tokens
    pub refresh_token: Option<String>,
}

/// Persisted credentials, keyed by user
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self, user_id: &str) -> cued_common::Result<Option<Credential>>;

    async fn save(&self, user_id: &str, credential: &Credential) -> cued_common::Result<()>;
}

/// Refresh-token grant against the identity provider
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, CredentialError>;
}

/// Hands out per-session managed credentials
#[derive(Clone)]
pub struct CredentialLifecycle {
    store: Arc<dyn CredentialStore>,
    exchange: Arc<dyn TokenExchange>,
    cooldown: Duration,
    event_bus: EventBus,
}

impl CredentialLifecycle {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        exchange: Arc<dyn TokenExchange>,
        cooldown: Duration,
        event_bus: EventBus,
    ) -> Self {
        Self {
            store,
            exchange,
            cooldown,
            event_bus,
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Load the user's credential, refreshing it first if already expired
    pub async fn acquire(&self, user_id: &str) -> Result<ManagedCredential, CredentialError> {
        let credential = self
            .store
            .load(user_id)
            .await?
            .ok_or_else(|| CredentialError::NotFound(user_id.to_string()))?;

        let mut managed = ManagedCredential {
            user_id: user_id.to_string(),
            credential,
            last_refresh_attempt: None,
            lifecycle: self.clone(),
        };

        if managed.credential.is_expired() {
            info!(user_id = %user_id, "Credential expired at startup, refreshing");
            managed.refresh().await?;
        }

        Ok(managed)
    }
}

/// A credential owned by a single scheduler, with its refresh history
pub struct ManagedCredential {
    user_id: String,
    credential: Credential,
    last_refresh_attempt: Option<Instant>,
    lifecycle: CredentialLifecycle,
}

impl ManagedCredential {
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn last_refresh_attempt(&self) -> Option<Instant> {
        self.last_refresh_attempt
    }

    /// Whether the cooldown since the last attempt has elapsed
    pub fn can_refresh(&self) -> bool {
        match self.last_refresh_attempt {
            None => true,
            Some(at) => at.elapsed() >= self.lifecycle.cooldown,
        }
    }

    /// Refresh ahead of the next call if the credential has expired and the
    /// cooldown allows it; otherwise the stale credential is used as is
    pub async fn ensure_fresh(&mut self) -> Result<(), CredentialError> {
        if self.credential.is_expired() && self.can_refresh() {
            debug!(user_id = %self.user_id, "Credential expired mid-session, refreshing");
            self.refresh().await?;
        }
        Ok(())
    }

    /// Failure policy for a remote-call error
    ///
    /// Outside the cooldown: one refresh, then the caller resumes.
    /// Inside the cooldown: `CooldownActive`, which the caller treats as fatal.
    pub async fn recover_from(&mut self, error: &PlaybackError) -> Result<(), CredentialError> {
        if let Some(at) = self.last_refresh_attempt {
            let since = at.elapsed();
            if since < self.lifecycle.cooldown {
                warn!(
                    user_id = %self.user_id,
                    error = %error,
                    since_last_attempt_ms = since.as_millis() as u64,
                    "Remote call failed inside refresh cooldown"
                );
                return Err(CredentialError::CooldownActive {
                    since_last_attempt_ms: since.as_millis() as u64,
                    cooldown_ms: self.lifecycle.cooldown.as_millis() as u64,
                });
            }
        }

        info!(user_id = %self.user_id, error = %error, "Remote call failed, refreshing credential");
        self.refresh().await
    }

    /// Exactly one exchange; the attempt is recorded before it is issued
    async fn refresh(&mut self) -> Result<(), CredentialError> {
        self.last_refresh_attempt = Some(Instant::now());

        let refreshed = self
            .lifecycle
            .exchange
            .refresh(&self.credential.refresh_token)
            .await?;

        let now = Utc::now();
        let credential = Credential {
            access_token: refreshed.access_token,
            refresh_token: refreshed
                .refresh_token
                .unwrap_or_else(|| self.credential.refresh_token.clone()),
            expires_at: cued_common::time::expires_after(now, refreshed.expires_in),
            account_ref: self.credential.account_ref.clone(),
        };

        self.lifecycle.store.save(&self.user_id, &credential).await?;
        self.credential = credential;

        info!(
            user_id = %self.user_id,
            expires_at = %self.credential.expires_at,
            "Credential refreshed"
        );
        self.lifecycle.event_bus.emit_lossy(SessionEvent::CredentialRefreshed {
            user_id: self.user_id.clone(),
            expires_at: self.credential.expires_at,
            timestamp: now,
        });

        Ok(())
    }
}
