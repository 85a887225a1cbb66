//! Shared JWKS verifier cache with TTL, exponential backoff on failure, and
//! stale-on-error semantics.
//!
//! One cache is constructed at startup and shared by every handler; tests
//! build their own instances (or call [`JwksCache::clear`]) so state never
//! leaks between them.

use async_trait::async_trait;
use blender_http_safe::{FetchSettings, fetch_json};
use jsonwebtoken::DecodingKey;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct JwksFetchError {
    pub url: String,
    pub message: String,
}

/// The transport used to retrieve a key set. The production implementation
/// goes through the safe fetcher; tests substitute their own.
#[async_trait]
pub trait JwksFetch: Send + Sync {
    async fn fetch(&self, url: &str) -> anyhow::Result<Value>;
}

/// [`JwksFetch`] over [`blender_http_safe::fetch_json`], inheriting its URL
/// vetting, redirect re-validation, and size cap.
pub struct SafeJwksFetcher {
    client: reqwest::Client,
    settings: FetchSettings,
}

impl SafeJwksFetcher {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(settings: FetchSettings) -> anyhow::Result<Self> {
        let client = blender_http_safe::no_redirect_client()?;
        Ok(Self { client, settings })
    }
}

#[async_trait]
impl JwksFetch for SafeJwksFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<Value> {
        fetch_json(&self.client, url, &self.settings)
            .await
            .map(Value::Object)
            .ok_or_else(|| anyhow::anyhow!("JWKS fetch failed or was blocked"))
    }
}

struct JwksEntry {
    jwks: Option<Value>,
    keys: HashMap<String, DecodingKey>,
    expires_at: f64,
    next_retry_at: f64,
    backoff_s: f64,
}

impl JwksEntry {
    fn new(backoff_initial_s: f64) -> Self {
        Self {
            jwks: None,
            keys: HashMap::new(),
            expires_at: 0.0,
            next_retry_at: 0.0,
            backoff_s: backoff_initial_s,
        }
    }

    fn cached(&self) -> Option<(Value, HashMap<String, DecodingKey>)> {
        self.jwks.as_ref().map(|j| (j.clone(), self.keys.clone()))
    }
}

#[derive(Clone)]
pub struct JwksCache {
    inner: Arc<Inner>,
}

struct Inner {
    ttl_s: f64,
    backoff_initial_s: f64,
    backoff_max_s: f64,
    entries: Mutex<HashMap<String, JwksEntry>>,
}

impl JwksCache {
    #[must_use]
    pub fn new(ttl_s: f64, backoff_initial_s: f64, backoff_max_s: f64) -> Self {
        let backoff_initial_s = backoff_initial_s.max(0.1);
        Self {
            inner: Arc::new(Inner {
                ttl_s: ttl_s.max(0.0),
                backoff_initial_s,
                backoff_max_s: backoff_max_s.max(backoff_initial_s),
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Return `(jwks, keys_by_kid)` for `url`.
    ///
    /// Fresh cached documents are served directly. A URL in backoff serves
    /// its stale document if one exists; with nothing cached, `required`
    /// decides between failing and returning empty. Fetches happen outside
    /// the cache lock.
    ///
    /// # Errors
    ///
    /// Returns [`JwksFetchError`] when the key set is `required` but cannot
    /// be served from cache or network.
    pub async fn get(
        &self,
        url: &str,
        fetcher: &dyn JwksFetch,
        force_refresh: bool,
        required: bool,
        label: &str,
    ) -> Result<(Value, HashMap<String, DecodingKey>), JwksFetchError> {
        self.get_at(url, fetcher, force_refresh, required, label, now_s())
            .await
    }

    /// [`JwksCache::get`] with an explicit clock, so TTL and backoff
    /// arithmetic is deterministic under test.
    pub async fn get_at(
        &self,
        url: &str,
        fetcher: &dyn JwksFetch,
        force_refresh: bool,
        required: bool,
        label: &str,
        now: f64,
    ) -> Result<(Value, HashMap<String, DecodingKey>), JwksFetchError> {
        {
            let mut entries = self.inner.entries.lock();
            let entry = entries
                .entry(url.to_string())
                .or_insert_with(|| JwksEntry::new(self.inner.backoff_initial_s));

            if !force_refresh
                && now < entry.expires_at
                && let Some(cached) = entry.cached()
            {
                return Ok(cached);
            }

            if !force_refresh && now < entry.next_retry_at {
                if let Some(cached) = entry.cached() {
                    return Ok(cached);
                }
                if required {
                    return Err(JwksFetchError {
                        url: url.to_string(),
                        message: format!(
                            "{label} JWKS fetch is in backoff and no cached keys exist"
                        ),
                    });
                }
                return Ok(empty());
            }
        }

        match fetcher.fetch(url).await {
            Ok(document) => {
                let keys = build_public_keys(&document);
                let mut entries = self.inner.entries.lock();
                let entry = entries
                    .entry(url.to_string())
                    .or_insert_with(|| JwksEntry::new(self.inner.backoff_initial_s));
                entry.jwks = Some(document.clone());
                entry.keys = keys.clone();
                entry.expires_at = now + self.inner.ttl_s;
                entry.next_retry_at = 0.0;
                entry.backoff_s = self.inner.backoff_initial_s;
                Ok((document, keys))
            }
            Err(e) => {
                error!(label, url, error = %e, "error fetching JWKS");
                let mut entries = self.inner.entries.lock();
                let entry = entries
                    .entry(url.to_string())
                    .or_insert_with(|| JwksEntry::new(self.inner.backoff_initial_s));
                entry.next_retry_at = now + entry.backoff_s;
                entry.backoff_s = (entry.backoff_s * 2.0).min(self.inner.backoff_max_s);
                if let Some(cached) = entry.cached() {
                    return Ok(cached);
                }
                if required {
                    return Err(JwksFetchError {
                        url: url.to_string(),
                        message: format!(
                            "{label} JWKS could not be fetched and no cached keys exist"
                        ),
                    });
                }
                Ok(empty())
            }
        }
    }

    /// Drop every cached entry. Intended for tests; production code never
    /// resets the cache.
    pub fn clear(&self) {
        self.inner.entries.lock().clear();
    }

    /// Observe `(next_retry_at, backoff_s)` for a URL. Intended for tests.
    #[must_use]
    pub fn backoff_state(&self, url: &str) -> Option<(f64, f64)> {
        let entries = self.inner.entries.lock();
        entries.get(url).map(|e| (e.next_retry_at, e.backoff_s))
    }
}

fn empty() -> (Value, HashMap<String, DecodingKey>) {
    (json!({}), HashMap::new())
}

fn now_s() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Build verifier material from a JWKS document, skipping entries that are
/// missing a `kid` or whose material cannot be constructed.
fn build_public_keys(document: &Value) -> HashMap<String, DecodingKey> {
    let mut keys = HashMap::new();
    let Some(entries) = document.get("keys").and_then(Value::as_array) else {
        return keys;
    };
    for jwk in entries {
        let Some(kid) = jwk.get("kid").and_then(Value::as_str) else {
            continue;
        };
        let (Some(n), Some(e)) = (
            jwk.get("n").and_then(Value::as_str),
            jwk.get("e").and_then(Value::as_str),
        ) else {
            warn!(kid, "skipping JWK without RSA components");
            continue;
        };
        match DecodingKey::from_rsa_components(n, e) {
            Ok(key) => {
                keys.insert(kid.to_string(), key);
            }
            Err(error) => {
                warn!(kid, %error, "skipping invalid JWK");
            }
        }
    }
    keys
}
