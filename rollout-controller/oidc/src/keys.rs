use ahash::AHashMap as HashMap;
use jsonwebtoken::DecodingKey;
use parking_lot::RwLock;
use serde::Deserialize;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;

const TTL: Duration = Duration::from_secs(60 * 60);
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum KeysError {
    #[error("failed to fetch key set from {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("key set endpoint returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("key set response exceeds {0} bytes")]
    TooLarge(usize),

    #[error("failed to parse key set: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("key set contains no usable RSA keys")]
    Empty,
}

#[derive(Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: String,
    #[serde(default)]
    kty: String,
    #[serde(default)]
    n: String,
    #[serde(default)]
    e: String,
}

type Snapshot = Arc<HashMap<String, DecodingKey>>;

struct Cached {
    keys: Snapshot,
    fresh_until: Instant,
}

/// Caches the provider's public keys, indexed by kid.
///
/// Readers take an immutable snapshot under a read lock; a stale or empty
/// cache is refilled by whichever caller first takes the refresh lock, so a
/// burst of verifies triggers at most one fetch.
pub(crate) struct KeyCache {
    url: String,
    http: reqwest::Client,
    ttl: Duration,
    cached: RwLock<Option<Cached>>,
    refresh: tokio::sync::Mutex<()>,
}

impl KeyCache {
    pub(crate) fn new(url: String) -> Self {
        Self::with_ttl(url, TTL)
    }

    pub(crate) fn with_ttl(url: String, ttl: Duration) -> Self {
        Self {
            url,
            http: reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .expect("default HTTP client must build"),
            ttl,
            cached: RwLock::new(None),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the current key snapshot, fetching if the cache is empty or
    /// past its TTL.
    pub(crate) async fn get(&self) -> Result<Snapshot, KeysError> {
        if let Some(keys) = self.fresh() {
            return Ok(keys);
        }

        let _refresh = self.refresh.lock().await;
        // Another caller may have refreshed while we waited on the lock.
        if let Some(keys) = self.fresh() {
            return Ok(keys);
        }

        let keys = self.fetch().await?;
        let snapshot: Snapshot = Arc::new(keys);
        *self.cached.write() = Some(Cached {
            keys: snapshot.clone(),
            fresh_until: Instant::now() + self.ttl,
        });
        tracing::debug!(key_count = snapshot.len(), "refreshed key set cache");
        Ok(snapshot)
    }

    /// Drops the cached snapshot so the next lookup refetches.
    pub(crate) fn invalidate(&self) {
        *self.cached.write() = None;
    }

    fn fresh(&self) -> Option<Snapshot> {
        self.cached
            .read()
            .as_ref()
            .filter(|cached| Instant::now() < cached.fresh_until)
            .map(|cached| cached.keys.clone())
    }

    async fn fetch(&self) -> Result<HashMap<String, DecodingKey>, KeysError> {
        let mut rsp = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|source| KeysError::Fetch {
                url: self.url.clone(),
                source,
            })?;
        if rsp.status() != reqwest::StatusCode::OK {
            return Err(KeysError::Status(rsp.status()));
        }

        let mut body = Vec::new();
        while let Some(chunk) = rsp.chunk().await.map_err(|source| KeysError::Fetch {
            url: self.url.clone(),
            source,
        })? {
            if body.len() + chunk.len() > MAX_BODY_BYTES {
                return Err(KeysError::TooLarge(MAX_BODY_BYTES));
            }
            body.extend_from_slice(&chunk);
        }

        let jwks: Jwks = serde_json::from_slice(&body).map_err(KeysError::Parse)?;
        let mut keys = HashMap::new();
        for jwk in jwks.keys {
            if jwk.kty != "RSA" {
                continue;
            }
            match DecodingKey::from_rsa_components(&jwk.n, &jwk.e) {
                Ok(key) => {
                    keys.insert(jwk.kid, key);
                }
                Err(error) => {
                    tracing::warn!(kid = %jwk.kid, %error, "skipping malformed key set entry");
                }
            }
        }
        if keys.is_empty() {
            return Err(KeysError::Empty);
        }
        Ok(keys)
    }
}
