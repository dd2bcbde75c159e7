//! In-memory queue store for tests/dev.
//!
//! A single mutex guards all records, so a claim is trivially atomic. The
//! semantics (ready predicate, CAS conditions, ordering) match the Postgres
//! store.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use batchrelay_core::{
    BatchId, DeliveryRecord, DeliveryStatus, ErrorCode, NewDeliveryRecord, OwnerId, RecordId,
    RecordUpdate,
};

use super::{ABANDONED_MESSAGE, QueueStats, QueueStore, QueueStoreError};

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    records: BTreeMap<RecordId, DeliveryRecord>,
}

#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    state: Mutex<State>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of every record, in id order.
    pub fn all(&self) -> Vec<DeliveryRecord> {
        self.lock().records.values().cloned().collect()
    }

    /// Overwrite a stored record as-is (test setup for crash scenarios).
    pub fn put(&self, record: DeliveryRecord) {
        let mut state = self.lock();
        state.next_id = state.next_id.max(record.id.get());
        state.records.insert(record.id, record);
    }
}

fn oldest_first(records: &mut [DeliveryRecord]) {
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}

#[async_trait::async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn insert(&self, record: NewDeliveryRecord) -> Result<DeliveryRecord, QueueStoreError> {
        let mut state = self.lock();
        state.next_id += 1;
        let record = record.into_record(RecordId::new(state.next_id));
        state.records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: RecordId) -> Result<Option<DeliveryRecord>, QueueStoreError> {
        Ok(self.lock().records.get(&id).cloned())
    }

    async fn update_state(
        &self,
        id: RecordId,
        update: &RecordUpdate,
        expected_version: Option<i64>,
    ) -> Result<DeliveryRecord, QueueStoreError> {
        update.expected_status.transition(update.status)?;
        let mut state = self.lock();
        let record = state
            .records
            .get_mut(&id)
            .ok_or(QueueStoreError::NotFound(id))?;

        if let Some(expected) = expected_version {
            if record.version != expected {
                return Err(QueueStoreError::Conflict {
                    id,
                    reason: format!("expected version {expected}, found {}", record.version),
                });
            }
        }
        if !update.matches(record) {
            return Err(QueueStoreError::Conflict {
                id,
                reason: format!(
                    "expected {} held by {:?}, found {} held by {:?}",
                    update.expected_status,
                    update.expected_owner.as_ref().map(OwnerId::as_str),
                    record.status,
                    record.locked_by.as_ref().map(OwnerId::as_str),
                ),
            });
        }
        update.apply_to(record);
        Ok(record.clone())
    }

    async fn find_ready_for_retry(
        &self,
        now: DateTime<Utc>,
        lease_expiry: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>, QueueStoreError> {
        let mut ready: Vec<_> = self
            .lock()
            .records
            .values()
            .filter(|r| r.is_ready(now, lease_expiry))
            .cloned()
            .collect();
        oldest_first(&mut ready);
        ready.truncate(limit);
        Ok(ready)
    }

    async fn find_by_owner_and_status(
        &self,
        owner: &OwnerId,
        status: DeliveryStatus,
    ) -> Result<Vec<DeliveryRecord>, QueueStoreError> {
        let mut found: Vec<_> = self
            .lock()
            .records
            .values()
            .filter(|r| r.status == status && r.locked_by.as_ref() == Some(owner))
            .cloned()
            .collect();
        oldest_first(&mut found);
        Ok(found)
    }

    async fn claim_batch(
        &self,
        owner: &OwnerId,
        now: DateTime<Utc>,
        lease_expiry: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, QueueStoreError> {
        let mut state = self.lock();
        let mut ready: Vec<_> = state
            .records
            .values()
            .filter(|r| r.is_ready(now, lease_expiry))
            .map(|r| (r.created_at, r.id))
            .collect();
        ready.sort();
        ready.truncate(limit);

        let mut claimed = 0;
        for (_, id) in ready {
            if let Some(record) = state.records.get_mut(&id) {
                let update = record.claim(owner, now)?;
                update.apply_to(record);
                claimed += 1;
            }
        }
        Ok(claimed)
    }

    async fn find_by_batch_id(&self, batch_id: &BatchId) -> Result<Vec<DeliveryRecord>, QueueStoreError> {
        let mut found: Vec<_> = self
            .lock()
            .records
            .values()
            .filter(|r| &r.batch_id == batch_id)
            .cloned()
            .collect();
        oldest_first(&mut found);
        Ok(found)
    }

    async fn list_by_status(
        &self,
        status: DeliveryStatus,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>, QueueStoreError> {
        let mut found: Vec<_> = self
            .lock()
            .records
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        oldest_first(&mut found);
        found.truncate(limit);
        Ok(found)
    }

    async fn fail_abandoned(
        &self,
        now: DateTime<Utc>,
        lease_expiry: DateTime<Utc>,
    ) -> Result<u64, QueueStoreError> {
        let mut state = self.lock();
        let mut failed = 0;
        for record in state.records.values_mut() {
            if record.is_abandoned(lease_expiry) {
                let update = record.fail(now, ABANDONED_MESSAGE, ErrorCode::LEASE_EXPIRED)?;
                update.apply_to(record);
                failed += 1;
            }
        }
        Ok(failed)
    }

    async fn stats(&self) -> Result<QueueStats, QueueStoreError> {
        let mut stats = QueueStats::default();
        for record in self.lock().records.values() {
            stats.add(record.status, 1);
        }
        Ok(stats)
    }
}
