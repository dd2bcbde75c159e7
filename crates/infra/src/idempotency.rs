//! At-most-once guard for first-attempt deliveries.
//!
//! Upstream queues deliver at least once, so the same batch can reach two
//! consumers. The first caller to mark a batch wins; later callers see a
//! duplicate until the marker expires or is cleared.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use batchrelay_core::BatchId;

use crate::kv::{CacheError, SharedCache};

pub const PROCESSED_PREFIX: &str = "processed:batch:";

pub const DEFAULT_MARKER_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

fn marker_key(batch_id: &BatchId) -> String {
    format!("{PROCESSED_PREFIX}{}", batch_id.as_str())
}

#[derive(Debug, Clone)]
pub struct IdempotencyGuard<C> {
    cache: C,
    ttl: Duration,
}

impl<C: SharedCache> IdempotencyGuard<C> {
    pub fn new(cache: C, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    /// True only for the first caller per batch within the TTL.
    pub async fn mark_as_processed(&self, batch_id: &BatchId) -> Result<bool, CacheError> {
        let first_seen = Utc::now().to_rfc3339();
        let fresh = self
            .cache
            .set_if_absent(&marker_key(batch_id), &first_seen, self.ttl)
            .await?;
        if fresh {
            debug!(batch_id = %batch_id, "batch marked as processed");
        } else {
            info!(batch_id = %batch_id, "duplicate batch detected");
        }
        Ok(fresh)
    }

    pub async fn was_already_processed(&self, batch_id: &BatchId) -> Result<bool, CacheError> {
        self.cache.exists(&marker_key(batch_id)).await
    }

    pub async fn clear_processed_flag(&self, batch_id: &BatchId) -> Result<(), CacheError> {
        if self.cache.delete(&marker_key(batch_id)).await? {
            debug!(batch_id = %batch_id, "processed marker cleared");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::kv::InMemoryCache;

    fn guard() -> IdempotencyGuard<Arc<InMemoryCache>> {
        IdempotencyGuard::new(Arc::new(InMemoryCache::new()), Duration::from_secs(60))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn only_one_concurrent_caller_wins() {
        let guard = Arc::new(guard());
        let batch = BatchId::parse("batch-42").unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let guard = guard.clone();
            let batch = batch.clone();
            handles.push(tokio::spawn(async move { guard.mark_as_processed(&batch).await.unwrap() }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(guard.was_already_processed(&batch).await.unwrap());
    }

    #[tokio::test]
    async fn clearing_allows_the_batch_again() {
        let guard = guard();
        let batch = BatchId::parse("batch-7").unwrap();
        assert!(guard.mark_as_processed(&batch).await.unwrap());
        guard.clear_processed_flag(&batch).await.unwrap();
        assert!(!guard.was_already_processed(&batch).await.unwrap());
        assert!(guard.mark_as_processed(&batch).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn marker_expires_after_ttl() {
        let guard = guard();
        let batch = BatchId::parse("batch-8").unwrap();
        assert!(guard.mark_as_processed(&batch).await.unwrap());
        assert!(!guard.mark_as_processed(&batch).await.unwrap());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(guard.mark_as_processed(&batch).await.unwrap());
    }
}
