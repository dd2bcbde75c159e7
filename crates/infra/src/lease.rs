//! Lease manager: hands ready records to exactly one owner.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use batchrelay_core::{DeliveryRecord, DeliveryStatus, OwnerId};

use crate::store::{QueueStore, QueueStoreError};

/// Claims work for one owner with a fixed lease timeout.
///
/// A lease is never renewed; it either ends in a state write by its owner or
/// expires, after which any owner may claim the record again.
#[derive(Debug, Clone)]
pub struct LeaseManager<S> {
    store: S,
    owner: OwnerId,
    lease_timeout: Duration,
}

impl<S: QueueStore> LeaseManager<S> {
    pub fn new(store: S, owner: OwnerId, lease_timeout: Duration) -> Self {
        Self {
            store,
            owner,
            lease_timeout,
        }
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Leases acquired before this instant are stale.
    pub fn lease_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let timeout = chrono::Duration::from_std(self.lease_timeout)
            .unwrap_or_else(|_| chrono::Duration::zero());
        now - timeout
    }

    /// Claim up to `limit` records and return everything this owner now holds
    /// in LOCKED, with full payloads.
    pub async fn claim(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>, QueueStoreError> {
        let claimed = self
            .store
            .claim_batch(&self.owner, now, self.lease_expiry(now), limit)
            .await?;
        if claimed == 0 {
            debug!(owner = %self.owner, "no records ready for retry");
            return Ok(Vec::new());
        }

        let records = self
            .store
            .find_by_owner_and_status(&self.owner, DeliveryStatus::Locked)
            .await?;
        info!(owner = %self.owner, claimed, held = records.len(), "claimed records for retry");
        Ok(records)
    }

    /// Fail records abandoned by a crashed owner after their last attempt.
    pub async fn sweep_abandoned(&self, now: DateTime<Utc>) -> Result<u64, QueueStoreError> {
        self.store.fail_abandoned(now, self.lease_expiry(now)).await
    }
}
