// services/providers/token_cache.rs
use chrono::{DateTime, Utc};
use std::future::Future;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::errors::ProviderError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn expiring_in(value: impl Into<String>, seconds: i64) -> Self {
        AccessToken {
            value: value.into(),
            expires_at: Utc::now() + chrono::Duration::seconds(seconds),
        }
    }
}

/// Cached bearer token for one provider product.
///
/// The slot lock is held across a refresh, so at most one refresh is in
/// flight and concurrent callers wait for its result instead of starting
/// their own.
#[derive(Debug)]
pub struct TokenCache {
    name: &'static str,
    refresh_margin: chrono::Duration,
    slot: Mutex<Option<AccessToken>>,
}

impl TokenCache {
    pub fn new(name: &'static str) -> Self {
        Self::with_margin(name, chrono::Duration::seconds(60))
    }

    pub fn with_margin(name: &'static str, refresh_margin: chrono::Duration) -> Self {
        TokenCache {
            name,
            refresh_margin,
            slot: Mutex::new(None),
        }
    }

    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> Result<String, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AccessToken, ProviderError>>,
    {
        let mut slot = self.slot.lock().await;

        if let Some(token) = slot.as_ref() {
            if token.expires_at > Utc::now() + self.refresh_margin {
                debug!(cache = self.name, "Using cached access token");
                return Ok(token.value.clone());
            }
        }

        info!(cache = self.name, "🔑 Requesting new access token");
        let token = fetch().await?;
        let value = token.value.clone();
        *slot = Some(token);
        Ok(value)
    }

    /// Drops the cached token if it is still the one that was rejected.
    pub async fn invalidate(&self, rejected: &str) {
        let mut slot = self.slot.lock().await;
        if slot.as_ref().map(|t| t.value.as_str()) == Some(rejected) {
            info!(cache = self.name, "Access token rejected, invalidating");
            *slot = None;
        }
    }
}
