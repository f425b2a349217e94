use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Clone, Debug)]
struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

/// In-process key/value cache with optional per-entry TTL.
///
/// Backs [`CacheStore`](crate::store::CacheStore) for the memory store.
/// Expired entries are dropped lazily on access and by [`TtlCache::clear_expired`].
#[derive(Debug, Clone, Default)]
pub struct TtlCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl TtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.write().await;

        match entries.get(key) {
            Some(entry) if entry.is_expired(Instant::now()) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    pub async fn put(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    pub async fn remove(&self, key: &str) -> bool {
        let mut entries = self.entries.write().await;
        entries.remove(key).is_some()
    }

    /// Live keys starting with `prefix`, sorted
    pub async fn keys(&self, prefix: &str) -> Vec<String> {
        let entries = self.entries.read().await;
        let now = Instant::now();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub async fn clear_expired(&self) {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        entries.retain(|_, entry| !entry.is_expired(now));
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
