//! Key/value store contract used for token caching, ISA TTL markers, and
//! subscription/flight-detail records.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pluggable key/value store with expiry. Values are opaque strings; callers
/// serialize JSON themselves.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
    async fn expire(&self, key: &str, ttl: Duration) -> anyhow::Result<()>;
    async fn exists(&self, key: &str) -> anyhow::Result<bool>;
    /// Enumerate keys by prefix. Implementations must use an incremental
    /// server-side scan; listing the full keyspace is not an acceptable
    /// fallback.
    async fn scan(&self, prefix: &str) -> anyhow::Result<Vec<String>>;
}

/// Redis-backed store.
pub struct RedisStore {
    manager: redis::aio::ConnectionManager,
}

impl RedisStore {
    /// Connect and build a multiplexed connection manager.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the connection fails.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis::AsyncCommands::get(&mut conn, key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::AsyncCommands::set(&mut conn, key, value).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut conn = self.manager.clone();
        let _: bool = redis::AsyncCommands::expire(&mut conn, key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        let mut conn = self.manager.clone();
        let exists: bool = redis::AsyncCommands::exists(&mut conn, key).await?;
        Ok(exists)
    }

    async fn scan(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let mut conn = self.manager.clone();
        let pattern = format!("{prefix}*");
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<'_, String> =
            redis::AsyncCommands::scan_match(&mut conn, pattern).await?;
        while let Some(key) = iter.next_item().await.transpose()? {
            keys.push(key);
        }
        Ok(keys)
    }
}

#[derive(Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

/// In-memory store for tests and store-less development.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<HashMap<String, MemoryEntry>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut map = self.inner.lock();
        match map.get(key) {
            Some(entry) if entry.expired() => {
                map.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.inner.lock().insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> anyhow::Result<()> {
        if let Some(entry) = self.inner.lock().get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        let mut map = self.inner.lock();
        match map.get(key) {
            Some(entry) if entry.expired() => {
                map.remove(key);
                Ok(false)
            }
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    async fn scan(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let map = self.inner.lock();
        Ok(map
            .iter()
            .filter(|(k, entry)| k.starts_with(prefix) && !entry.expired())
            .map(|(k, _)| k.clone())
            .collect())
    }
}
