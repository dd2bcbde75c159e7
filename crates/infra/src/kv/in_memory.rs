//! In-memory cache for tests/dev. Expiry is evaluated lazily on access.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use super::{CacheError, SharedCache};

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at > now);
        entries
    }

    /// Remaining TTL of a live key.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.live()
            .get(key)
            .map(|e| e.expires_at.saturating_duration_since(now))
    }
}

#[async_trait::async_trait]
impl SharedCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.live().get(key).map(|e| e.value.clone()))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.live().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut entries = self.live();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.live().contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.live().remove(key).is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, CacheError> {
        let mut entries = self.live();
        match entries.get(key) {
            Some(e) if e.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = InMemoryCache::new();
        cache.set_with_ttl("k", "v", Duration::from_secs(5)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(!cache.exists("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn set_if_absent_only_wins_once_per_ttl() {
        let cache = InMemoryCache::new();
        assert!(cache.set_if_absent("k", "a", Duration::from_secs(1)).await.unwrap());
        assert!(!cache.set_if_absent("k", "b", Duration::from_secs(1)).await.unwrap());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.set_if_absent("k", "c", Duration::from_secs(1)).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn compare_and_delete_checks_value() {
        let cache = InMemoryCache::new();
        cache.set_with_ttl("k", "mine", Duration::from_secs(60)).await.unwrap();
        assert!(!cache.compare_and_delete("k", "theirs").await.unwrap());
        assert!(cache.compare_and_delete("k", "mine").await.unwrap());
        assert!(!cache.delete("k").await.unwrap());
    }
}
