use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use batchrelay_core::{
    BackoffPolicy, BatchId, BatchPayload, Clock, DeliveryRecord, NewDeliveryRecord, RecordId,
};

use super::client::BatchDelivery;
use crate::idempotency::IdempotencyGuard;
use crate::kv::{CacheError, SharedCache};
use crate::shutdown::ShutdownCoordinator;
use crate::store::{QueueStore, QueueStoreError};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum DeliveryOutcome {
    Delivered,
    Duplicate,
    Enqueued {
        #[serde(rename = "recordId")]
        record_id: RecordId,
        #[serde(rename = "errorCode")]
        error_code: String,
    },
}

#[derive(Debug, Error)]
pub enum DeliveryServiceError {
    #[error("idempotency check failed: {0}")]
    Idempotency(#[from] CacheError),

    /// Neither delivered nor persisted; the caller must not acknowledge.
    #[error("failed to persist undelivered batch {batch_id}: {source}")]
    Enqueue {
        batch_id: BatchId,
        #[source]
        source: QueueStoreError,
    },
}

/// First-attempt delivery for freshly produced batches.
///
/// Every failed first attempt is stored PENDING, terminal ones included, so
/// the payload is never dropped and the scheduler makes one more attempt
/// before marking it FAILED. The processed marker is kept for transient
/// failures and cleared for terminal ones. After a terminal failure an
/// upstream redelivery of the same batch is therefore attempted again and can
/// run alongside the queued record; the downstream sees at most one extra
/// delivery of a batch it already refused, which at-least-once semantics allow.
pub struct DeliveryService<D, S, C> {
    delivery: D,
    store: S,
    guard: IdempotencyGuard<C>,
    shutdown: ShutdownCoordinator,
    backoff: BackoffPolicy,
    max_retries: u32,
    clock: Arc<dyn Clock>,
}

impl<D, S, C> DeliveryService<D, S, C>
where
    D: BatchDelivery,
    S: QueueStore,
    C: SharedCache,
{
    pub fn new(
        delivery: D,
        store: S,
        guard: IdempotencyGuard<C>,
        shutdown: ShutdownCoordinator,
        backoff: BackoffPolicy,
        max_retries: u32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            delivery,
            store,
            guard,
            shutdown,
            backoff,
            max_retries,
            clock,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    #[instrument(skip(self, batch), fields(batch_id = %batch.batch_id))]
    pub async fn attempt_delivery(
        &self,
        batch: &BatchPayload,
    ) -> Result<DeliveryOutcome, DeliveryServiceError> {
        let _in_flight = self.shutdown.track();

        if !self.guard.mark_as_processed(&batch.batch_id).await? {
            return Ok(DeliveryOutcome::Duplicate);
        }

        let failure = match self.delivery.deliver(batch).await {
            Ok(()) => return Ok(DeliveryOutcome::Delivered),
            Err(failure) => failure,
        };

        let error_code = failure.code.to_string();
        match self.enqueue_failure(batch, &failure.message, &error_code).await {
            Ok(record) => {
                // Transient failures are now owned by the durable queue, so a
                // redelivery during the retry window stays a duplicate. A
                // terminal failure reopens the batch to redelivery even though
                // its record is still queued for one more attempt.
                if failure.class.is_terminal() {
                    self.clear_marker(&batch.batch_id).await;
                }
                Ok(DeliveryOutcome::Enqueued {
                    record_id: record.id,
                    error_code,
                })
            }
            Err(source) => {
                self.clear_marker(&batch.batch_id).await;
                error!(error = %source, error_code = %error_code, "failed to persist undelivered batch");
                Err(DeliveryServiceError::Enqueue {
                    batch_id: batch.batch_id.clone(),
                    source,
                })
            }
        }
    }

    /// Persist a batch whose first delivery failed as a PENDING record.
    pub async fn enqueue_failure(
        &self,
        batch: &BatchPayload,
        error_message: &str,
        error_code: &str,
    ) -> Result<DeliveryRecord, QueueStoreError> {
        let new = NewDeliveryRecord::from_failure(
            batch,
            error_message,
            error_code,
            self.max_retries,
            &self.backoff,
            self.clock.now(),
        )?;
        let record = self.store.insert(new).await?;
        info!(
            record_id = %record.id,
            batch_id = %record.batch_id,
            error_code,
            next_retry_at = ?record.next_retry_at,
            "undelivered batch queued for retry"
        );
        Ok(record)
    }

    async fn clear_marker(&self, batch_id: &BatchId) {
        if let Err(e) = self.guard.clear_processed_flag(batch_id).await {
            warn!(batch_id = %batch_id, error = %e, "failed to clear processed marker");
        }
    }
}
