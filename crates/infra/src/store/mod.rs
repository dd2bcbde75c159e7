//! Durable queue of delivery records.
//!
//! The store is the ground truth of what still needs delivery. Every
//! cross-instance mutation goes through one of two paths:
//!
//! - [`QueueStore::claim_batch`]: a single atomic conditional update that hands
//!   ready rows to one owner, skipping rows a concurrent claimer already holds.
//! - [`QueueStore::update_state`]: a single-row compare-and-swap on status,
//!   lease owner and (optionally) version.
//!
//! There is no read-then-write path, so two owners can never both believe they
//! hold the same record.
//!
//! ## Ready predicate
//!
//! A record is ready for retry when its status is PENDING, RETRYING or LOCKED,
//! `retry_count < max_retries`, `next_retry_at` is unset or due, and the lease
//! is free (`locked_by IS NULL OR locked_at < lease_expiry`). The lease clause
//! makes a crashed owner's records claimable again once the lease timeout has
//! passed, with no heartbeat.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use batchrelay_core::{
    BatchId, DeliveryRecord, DeliveryStatus, DomainError, NewDeliveryRecord, OwnerId, RecordId,
    RecordUpdate,
};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryQueueStore;
pub use postgres::PostgresQueueStore;

/// Message recorded on records failed by the abandoned-lease sweep.
pub const ABANDONED_MESSAGE: &str = "lease expired after retries were exhausted";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueueStoreError {
    #[error("delivery record not found: {0}")]
    NotFound(RecordId),

    /// The CAS condition did not hold; nothing was written.
    #[error("conflicting update on record {id}: {reason}")]
    Conflict { id: RecordId, reason: String },

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("failed to decode stored record: {0}")]
    Decode(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl QueueStoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, QueueStoreError::Conflict { .. })
    }
}

/// Record counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: u64,
    pub locked: u64,
    pub retrying: u64,
    pub success: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn add(&mut self, status: DeliveryStatus, count: u64) {
        match status {
            DeliveryStatus::Pending => self.pending += count,
            DeliveryStatus::Locked => self.locked += count,
            DeliveryStatus::Retrying => self.retrying += count,
            DeliveryStatus::Success => self.success += count,
            DeliveryStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.locked + self.retrying + self.success + self.failed
    }
}

#[async_trait::async_trait]
pub trait QueueStore: Send + Sync {
    /// Persist a new PENDING record.
    async fn insert(&self, record: NewDeliveryRecord) -> Result<DeliveryRecord, QueueStoreError>;

    async fn get(&self, id: RecordId) -> Result<Option<DeliveryRecord>, QueueStoreError>;

    /// Conditionally apply `update`. Fails with `Conflict` when the record is
    /// no longer in `update.expected_status` under `update.expected_owner`, or
    /// when `expected_version` is given and does not match.
    async fn update_state(
        &self,
        id: RecordId,
        update: &RecordUpdate,
        expected_version: Option<i64>,
    ) -> Result<DeliveryRecord, QueueStoreError>;

    /// Read-only view of what a claim would consider. Not a claim.
    async fn find_ready_for_retry(
        &self,
        now: DateTime<Utc>,
        lease_expiry: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>, QueueStoreError>;

    async fn find_by_owner_and_status(
        &self,
        owner: &OwnerId,
        status: DeliveryStatus,
    ) -> Result<Vec<DeliveryRecord>, QueueStoreError>;

    /// Atomically lock up to `limit` ready records (oldest first) for `owner`.
    /// Returns the number of records claimed.
    async fn claim_batch(
        &self,
        owner: &OwnerId,
        now: DateTime<Utc>,
        lease_expiry: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, QueueStoreError>;

    async fn find_by_batch_id(&self, batch_id: &BatchId) -> Result<Vec<DeliveryRecord>, QueueStoreError>;

    /// Records in `status`, oldest first.
    async fn list_by_status(
        &self,
        status: DeliveryStatus,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>, QueueStoreError>;

    /// Mark FAILED every LOCKED/RETRYING record whose lease expired after its
    /// retries were exhausted. Returns the number of records failed.
    async fn fail_abandoned(
        &self,
        now: DateTime<Utc>,
        lease_expiry: DateTime<Utc>,
    ) -> Result<u64, QueueStoreError>;

    async fn stats(&self) -> Result<QueueStats, QueueStoreError>;
}

#[async_trait::async_trait]
impl<S: QueueStore + ?Sized> QueueStore for Arc<S> {
    async fn insert(&self, record: NewDeliveryRecord) -> Result<DeliveryRecord, QueueStoreError> {
        (**self).insert(record).await
    }

    async fn get(&self, id: RecordId) -> Result<Option<DeliveryRecord>, QueueStoreError> {
        (**self).get(id).await
    }

    async fn update_state(
        &self,
        id: RecordId,
        update: &RecordUpdate,
        expected_version: Option<i64>,
    ) -> Result<DeliveryRecord, QueueStoreError> {
        (**self).update_state(id, update, expected_version).await
    }

    async fn find_ready_for_retry(
        &self,
        now: DateTime<Utc>,
        lease_expiry: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>, QueueStoreError> {
        (**self).find_ready_for_retry(now, lease_expiry, limit).await
    }

    async fn find_by_owner_and_status(
        &self,
        owner: &OwnerId,
        status: DeliveryStatus,
    ) -> Result<Vec<DeliveryRecord>, QueueStoreError> {
        (**self).find_by_owner_and_status(owner, status).await
    }

    async fn claim_batch(
        &self,
        owner: &OwnerId,
        now: DateTime<Utc>,
        lease_expiry: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, QueueStoreError> {
        (**self).claim_batch(owner, now, lease_expiry, limit).await
    }

    async fn find_by_batch_id(&self, batch_id: &BatchId) -> Result<Vec<DeliveryRecord>, QueueStoreError> {
        (**self).find_by_batch_id(batch_id).await
    }

    async fn list_by_status(
        &self,
        status: DeliveryStatus,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>, QueueStoreError> {
        (**self).list_by_status(status, limit).await
    }

    async fn fail_abandoned(
        &self,
        now: DateTime<Utc>,
        lease_expiry: DateTime<Utc>,
    ) -> Result<u64, QueueStoreError> {
        (**self).fail_abandoned(now, lease_expiry).await
    }

    async fn stats(&self) -> Result<QueueStats, QueueStoreError> {
        (**self).stats().await
    }
}
