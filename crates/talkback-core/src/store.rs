//! TTL-keyed state store for conversation data.
//!
//! Every `set` replaces the previous value and restarts its expiry window.
//! A missing or expired key is reported as `Ok(None)`, never as an error.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::trace;

use crate::error::Result;

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Store `value` under `key`, replacing any prior value, expiring after `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Fetch the live value for `key`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Remove `key`. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;
}

struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-process store with lazy expiry.
///
/// Uses `tokio::time::Instant`, so paused-clock tests can advance past a TTL.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let expires_at = Instant::now() + ttl;
        self.entries
            .write()
            .await
            .insert(key.to_string(), Entry { value, expires_at });
        trace!(key, ttl_secs = ttl.as_secs(), "Stored value");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(e) if e.expires_at > now => return Ok(Some(e.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired: evict under the write lock, re-checking in case of a concurrent set.
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| e.expires_at <= now) {
            entries.remove(key);
            trace!(key, "Evicted expired value");
        }
        Ok(entries
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(1200);

    #[tokio::test(start_paused = true)]
    async fn test_set_then_get() {
        let store = MemoryStore::new();
        store.set("talk:u1:s1", "v1".into(), TTL).await.unwrap();
        assert_eq!(store.get("talk:u1:s1").await.unwrap().as_deref(), Some("v1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expires_after_ttl() {
        let store = MemoryStore::new();
        store.set("k", "v".into(), TTL).await.unwrap();

        tokio::time::advance(TTL - Duration::from_secs(1)).await;
        assert!(store.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_replaces_and_refreshes_ttl() {
        let store = MemoryStore::new();
        store.set("k", "old".into(), TTL).await.unwrap();

        tokio::time::advance(Duration::from_secs(1000)).await;
        store.set("k", "new".into(), TTL).await.unwrap();

        // Past the first window, inside the refreshed one.
        tokio::time::advance(Duration::from_secs(1000)).await;
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryStore::new();
        store.set("k", "v".into(), TTL).await.unwrap();
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = MemoryStore::new();
        store.set("short", "a".into(), Duration::from_secs(5)).await.unwrap();
        store.set("long", "b".into(), TTL).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.len().await, 1);
    }
}
