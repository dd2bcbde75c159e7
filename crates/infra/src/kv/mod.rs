//! Shared key-value cache and the distributed lock built on it.
//!
//! Two backends implement [`SharedCache`]: Redis (behind the `redis` feature)
//! for multi-instance deployments, and an in-memory map for tests and
//! single-process development.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_cache;

pub use in_memory::InMemoryCache;
#[cfg(feature = "redis")]
pub use redis_cache::RedisCache;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache connection error: {0}")]
    Connection(String),

    #[error("cache command error: {0}")]
    Command(String),
}

/// String values with per-key TTL.
#[async_trait::async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Atomic set-if-absent. Returns true when this call created the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Returns true when a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Atomically delete `key` only if it still holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, CacheError>;
}

#[async_trait::async_trait]
impl<C: SharedCache + ?Sized> SharedCache for Arc<C> {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        (**self).get(key).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        (**self).set_with_ttl(key, value, ttl).await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        (**self).set_if_absent(key, value, ttl).await
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        (**self).exists(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        (**self).delete(key).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, CacheError> {
        (**self).compare_and_delete(key, expected).await
    }
}

/// Proof of holding a lock; required to release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    fn new() -> Self {
        Self(Uuid::now_v7().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Mutex shared by every instance that talks to the same cache.
///
/// The holder's entry expires after `lease`, so a crashed holder cannot block
/// others forever. Release is compare-and-delete on the holder's token.
#[derive(Debug, Clone)]
pub struct DistributedLock<C> {
    cache: C,
    lease: Duration,
    poll_interval: Duration,
}

impl<C: SharedCache> DistributedLock<C> {
    pub fn new(cache: C, lease: Duration, poll_interval: Duration) -> Self {
        Self {
            cache,
            lease,
            poll_interval,
        }
    }

    pub async fn try_acquire(&self, name: &str) -> Result<Option<LockToken>, CacheError> {
        let token = LockToken::new();
        let acquired = self.cache.set_if_absent(name, token.as_str(), self.lease).await?;
        Ok(acquired.then_some(token))
    }

    /// Poll until acquired or `wait` elapses. `Ok(None)` means timed out.
    pub async fn acquire_with_timeout(
        &self,
        name: &str,
        wait: Duration,
    ) -> Result<Option<LockToken>, CacheError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(token) = self.try_acquire(name).await? {
                debug!(lock = name, "distributed lock acquired");
                return Ok(Some(token));
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(lock = name, wait_ms = wait.as_millis() as u64, "timed out waiting for distributed lock");
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Returns false when the lease had already lapsed (someone else may hold it now).
    pub async fn release(&self, name: &str, token: &LockToken) -> Result<bool, CacheError> {
        let released = self.cache.compare_and_delete(name, token.as_str()).await?;
        if !released {
            warn!(lock = name, "distributed lock lease lapsed before release");
        }
        Ok(released)
    }
}
