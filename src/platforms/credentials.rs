//! Access-token handling.
//!
//! Token acquisition itself (the OAuth refresh dance) sits behind
//! `CredentialProvider`. `TokenCache` keeps the current token until shortly
//! before it expires and refreshes on demand.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::AppConfig;

/// Refresh this long before the advertised expiry.
const EXPIRY_SKEW_SECS: i64 = 60;

/// An opaque bearer token and its expiry.
pub struct AccessToken {
    pub token: SecretString,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: SecretString::new(token.into()),
            expires_at,
        }
    }

    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(EXPIRY_SKEW_SECS) < self.expires_at
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of access tokens.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn fetch_token(&self) -> Result<AccessToken>;
}

/// Reads a long-lived token from an environment variable.
pub struct EnvTokenProvider {
    env_name: String,
    lifetime: Duration,
}

impl EnvTokenProvider {
    pub fn new(env_name: impl Into<String>) -> Self {
        Self {
            env_name: env_name.into(),
            lifetime: Duration::hours(1),
        }
    }
}

#[async_trait]
impl CredentialProvider for EnvTokenProvider {
    async fn fetch_token(&self) -> Result<AccessToken> {
        let token = AppConfig::resolve_env(&self.env_name)?;
        Ok(AccessToken::new(token, Utc::now() + self.lifetime))
    }
}

/// Caches a provider's token until it is about to expire.
pub struct TokenCache {
    provider: Box<dyn CredentialProvider>,
    current: Mutex<Option<AccessToken>>,
}

impl TokenCache {
    pub fn new(provider: Box<dyn CredentialProvider>) -> Self {
        Self {
            provider,
            current: Mutex::new(None),
        }
    }

    /// Current bearer token, refreshing when missing or near expiry.
    pub async fn bearer(&self) -> Result<String> {
        let mut guard = self.current.lock().await;
        if let Some(token) = guard.as_ref() {
            if token.is_fresh(Utc::now()) {
                return Ok(token.token.expose_secret().clone());
            }
            debug!(expires_at = %token.expires_at, "Access token near expiry, refreshing");
        }

        let fresh = self.provider.fetch_token().await.context("Failed to refresh access token")?;
        info!(expires_at = %fresh.expires_at, "Access token refreshed");
        let bearer = fresh.token.expose_secret().clone();
        *guard = Some(fresh);
        Ok(bearer)
    }

    /// Drop the cached token (e.g. after a 401) so the next call refreshes.
    pub async fn invalidate(&self) {
        *self.current.lock().await = None;
    }
}
