//! Verification key sources.
//!
//! [`StaticKeySource`] serves one shared HMAC secret. [`JwksKeySource`]
//! fetches the issuer's published key set over HTTP and caches it:
//!
//! - A fresh cache (younger than the TTL) answers without I/O.
//! - A stale cache, or a token whose `kid` is not in the cached set, triggers a
//!   refetch. Unknown-`kid` refetches happen at most once per
//!   [`JwksKeySource::MIN_REFRESH_INTERVAL`] so forged `kid`s cannot turn into
//!   a request flood against the issuer.
//! - Concurrent refreshes are collapsed: one request fetches, the others wait
//!   and reuse its result.
//! - A failed fetch rejects the token. Nothing is retried inline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{DecodingKey, Header};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::AuthError;
use crate::metrics;

/// Resolves the key that should verify a token with the given header.
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn key_for(&self, header: &Header) -> Result<DecodingKey, AuthError>;
}

/// One shared HMAC secret, independent of `kid`.
pub struct StaticKeySource {
    key: DecodingKey,
}

impl StaticKeySource {
    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
        }
    }
}

#[async_trait]
impl KeySource for StaticKeySource {
    async fn key_for(&self, _header: &Header) -> Result<DecodingKey, AuthError> {
        Ok(self.key.clone())
    }
}

/// Key source used when no secret or key set is configured.
///
/// Every token is rejected.
#[derive(Debug, Default)]
pub struct NoKeySource;

#[async_trait]
impl KeySource for NoKeySource {
    async fn key_for(&self, _header: &Header) -> Result<DecodingKey, AuthError> {
        Err(AuthError::KeySetUnavailable(
            "no verification key configured".to_string(),
        ))
    }
}

struct CachedKeys {
    keys: Arc<Vec<(Option<String>, DecodingKey)>>,
    fetched_at: Instant,
}

/// Remote key set with TTL cache and single-flight refresh.
pub struct JwksKeySource {
    url: String,
    client: reqwest::Client,
    ttl: Duration,
    min_refresh_interval: Duration,
    cache: RwLock<Option<CachedKeys>>,
    refresh: Mutex<()>,
}

impl JwksKeySource {
    /// Minimum spacing of refetches caused by unknown `kid`s.
    pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

    pub fn new(url: impl Into<String>, ttl: Duration, fetch_timeout: Duration) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(|e| AuthError::KeySetUnavailable(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            client,
            ttl,
            min_refresh_interval: Self::MIN_REFRESH_INTERVAL,
            cache: RwLock::new(None),
            refresh: Mutex::new(()),
        })
    }

    /// Override the unknown-`kid` refetch spacing.
    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    /// Number of keys currently cached.
    pub fn cached_keys(&self) -> usize {
        self.cache.read().as_ref().map_or(0, |c| c.keys.len())
    }

    async fn fetch(&self) -> Result<Vec<(Option<String>, DecodingKey)>, AuthError> {
        debug!(url = %self.url, "Fetching key set");
        let set: JwkSet = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| AuthError::KeySetUnavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| AuthError::KeySetUnavailable(format!("invalid key set: {e}")))?;

        let keys: Vec<_> = set
            .keys
            .iter()
            .filter_map(|jwk| match DecodingKey::from_jwk(jwk) {
                Ok(key) => Some((jwk.common.key_id.clone(), key)),
                Err(e) => {
                    warn!(kid = ?jwk.common.key_id, error = %e, "Skipping unusable key");
                    None
                }
            })
            .collect();

        info!(url = %self.url, keys = keys.len(), "Key set refreshed");
        Ok(keys)
    }
}

fn lookup(keys: &[(Option<String>, DecodingKey)], kid: Option<&str>) -> Option<DecodingKey> {
    match kid {
        Some(kid) => keys
            .iter()
            .find(|(key_id, _)| key_id.as_deref() == Some(kid))
            .map(|(_, key)| key.clone()),
        // Without a kid only an unambiguous single-key set can be used.
        None => match keys {
            [(_, key)] => Some(key.clone()),
            _ => None,
        },
    }
}

#[async_trait]
impl KeySource for JwksKeySource {
    async fn key_for(&self, header: &Header) -> Result<DecodingKey, AuthError> {
        let kid = header.kid.as_deref();
        let unknown = || AuthError::UnknownKey(kid.map(str::to_string));

        {
            let cache = self.cache.read();
            if let Some(cached) = cache.as_ref()
                && cached.fetched_at.elapsed() < self.ttl
                && let Some(key) = lookup(&cached.keys, kid)
            {
                return Ok(key);
            }
        }

        let _refresh = self.refresh.lock().await;

        // Another request may have refreshed while this one waited.
        {
            let cache = self.cache.read();
            if let Some(cached) = cache.as_ref()
                && cached.fetched_at.elapsed() < self.ttl
            {
                if let Some(key) = lookup(&cached.keys, kid) {
                    return Ok(key);
                }
                if cached.fetched_at.elapsed() < self.min_refresh_interval {
                    return Err(unknown());
                }
            }
        }

        match self.fetch().await {
            Ok(keys) => {
                metrics::record_jwks_refresh(true);
                let keys = Arc::new(keys);
                let found = lookup(&keys, kid);
                *self.cache.write() = Some(CachedKeys {
                    keys,
                    fetched_at: Instant::now(),
                });
                found.ok_or_else(unknown)
            }
            Err(err) => {
                metrics::record_jwks_refresh(false);
                warn!(url = %self.url, error = %err, "Key set refresh failed");
                Err(err)
            }
        }
    }
}
