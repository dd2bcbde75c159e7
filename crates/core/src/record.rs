//! Delivery record and its status state machine.
//!
//! ```text
//! PENDING --claim--> LOCKED --begin_attempt--> RETRYING
//! RETRYING --succeed--> SUCCESS
//! RETRYING --fail--> FAILED
//! RETRYING --release--> PENDING (next_retry_at scheduled)
//! LOCKED | RETRYING --claim (lease expired)--> LOCKED
//! LOCKED | RETRYING --fail (abandoned)--> FAILED
//! ```
//!
//! Every mutation is produced as a [`RecordUpdate`] that carries the status
//! (and lease owner) it expects to find, so a store can apply it as a single
//! compare-and-swap.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::error::DomainError;
use crate::id::{BatchId, OwnerId, RecordId, RequestId};
use crate::payload::BatchPayload;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Locked,
    Retrying,
    Success,
    Failed,
}

impl DeliveryStatus {
    pub const ALL: [DeliveryStatus; 5] = [
        DeliveryStatus::Pending,
        DeliveryStatus::Locked,
        DeliveryStatus::Retrying,
        DeliveryStatus::Success,
        DeliveryStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::Locked => "LOCKED",
            DeliveryStatus::Retrying => "RETRYING",
            DeliveryStatus::Success => "SUCCESS",
            DeliveryStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Success | DeliveryStatus::Failed)
    }

    /// Statuses whose rows carry `locked_by`/`locked_at`.
    pub fn holds_lease(&self) -> bool {
        matches!(self, DeliveryStatus::Locked | DeliveryStatus::Retrying)
    }

    /// Validate a state change and return the target status.
    pub fn transition(self, to: DeliveryStatus) -> Result<DeliveryStatus, DomainError> {
        use DeliveryStatus::*;
        let allowed = matches!(
            (self, to),
            (Pending, Locked)
                | (Locked, Locked)
                | (Retrying, Locked)
                | (Locked, Retrying)
                | (Retrying, Success)
                | (Retrying, Failed)
                | (Retrying, Pending)
                | (Locked, Failed)
        );
        if allowed {
            Ok(to)
        } else {
            Err(DomainError::IllegalTransition { from: self, to })
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(DeliveryStatus::Pending),
            "LOCKED" => Ok(DeliveryStatus::Locked),
            "RETRYING" => Ok(DeliveryStatus::Retrying),
            "SUCCESS" => Ok(DeliveryStatus::Success),
            "FAILED" => Ok(DeliveryStatus::Failed),
            other => Err(DomainError::validation(format!(
                "unknown delivery status: {other}"
            ))),
        }
    }
}

/// One batch that failed its first delivery and is now owned by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub id: RecordId,
    pub batch_id: BatchId,
    pub request_id: RequestId,
    pub file_name: Option<String>,
    pub payload: String,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: DeliveryStatus,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub locked_by: Option<OwnerId>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl DeliveryRecord {
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Lease is absent, or older than `lease_expiry`.
    pub fn lease_expired(&self, lease_expiry: DateTime<Utc>) -> bool {
        self.locked_by.is_none() || self.locked_at.is_some_and(|at| at < lease_expiry)
    }

    /// Claimable by any owner at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>, lease_expiry: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            DeliveryStatus::Pending | DeliveryStatus::Retrying | DeliveryStatus::Locked
        ) && !self.retries_exhausted()
            && self.next_retry_at.is_none_or(|at| at <= now)
            && self.lease_expired(lease_expiry)
    }

    /// Stale lease on a record that has no retries left.
    pub fn is_abandoned(&self, lease_expiry: DateTime<Utc>) -> bool {
        self.status.holds_lease()
            && self.retries_exhausted()
            && self.locked_by.is_some()
            && self.lease_expired(lease_expiry)
    }

    pub fn decode_payload(&self) -> Result<BatchPayload, DomainError> {
        BatchPayload::from_json(&self.payload)
    }

    fn update(&self, to: DeliveryStatus, now: DateTime<Utc>) -> Result<RecordUpdate, DomainError> {
        let status = self.status.transition(to)?;
        Ok(RecordUpdate {
            expected_status: self.status,
            expected_owner: self.locked_by.clone(),
            status,
            retry_count: self.retry_count,
            next_retry_at: self.next_retry_at,
            locked_by: self.locked_by.clone(),
            locked_at: self.locked_at,
            error_message: self.error_message.clone(),
            error_code: self.error_code.clone(),
            updated_at: now,
        })
    }

    /// Take the lease for `owner`.
    pub fn claim(&self, owner: &OwnerId, now: DateTime<Utc>) -> Result<RecordUpdate, DomainError> {
        let mut update = self.update(DeliveryStatus::Locked, now)?;
        update.locked_by = Some(owner.clone());
        update.locked_at = Some(now);
        Ok(update)
    }

    /// Start an attempt: bump `retry_count` and pre-schedule the attempt after
    /// this one in case the process dies mid-delivery.
    pub fn begin_attempt(
        &self,
        backoff: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Result<RecordUpdate, DomainError> {
        let mut update = self.update(DeliveryStatus::Retrying, now)?;
        update.retry_count = self.retry_count.saturating_add(1);
        update.next_retry_at = Some(backoff.next_retry_at(now, update.retry_count));
        Ok(update)
    }

    pub fn succeed(&self, now: DateTime<Utc>) -> Result<RecordUpdate, DomainError> {
        let mut update = self.update(DeliveryStatus::Success, now)?;
        update.next_retry_at = None;
        update.clear_lease();
        Ok(update)
    }

    pub fn fail(
        &self,
        now: DateTime<Utc>,
        error_message: impl Into<String>,
        error_code: impl Into<String>,
    ) -> Result<RecordUpdate, DomainError> {
        let mut update = self.update(DeliveryStatus::Failed, now)?;
        update.next_retry_at = None;
        update.clear_lease();
        update.error_message = Some(error_message.into());
        update.error_code = Some(error_code.into());
        Ok(update)
    }

    /// Give the record back to the queue, eligible again after the backoff.
    pub fn release(
        &self,
        backoff: &BackoffPolicy,
        now: DateTime<Utc>,
        error_message: impl Into<String>,
        error_code: impl Into<String>,
    ) -> Result<RecordUpdate, DomainError> {
        let mut update = self.update(DeliveryStatus::Pending, now)?;
        update.next_retry_at = Some(backoff.next_retry_at(now, self.retry_count));
        update.clear_lease();
        update.error_message = Some(error_message.into());
        update.error_code = Some(error_code.into());
        Ok(update)
    }
}

/// A conditional write against one record.
///
/// `expected_status` and `expected_owner` are the CAS condition; the remaining
/// fields are the new values of every mutable column.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpdate {
    pub expected_status: DeliveryStatus,
    pub expected_owner: Option<OwnerId>,
    pub status: DeliveryStatus,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub locked_by: Option<OwnerId>,
    pub locked_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl RecordUpdate {
    fn clear_lease(&mut self) {
        self.locked_by = None;
        self.locked_at = None;
    }

    /// Whether `record` is still in the state this update was computed from.
    pub fn matches(&self, record: &DeliveryRecord) -> bool {
        record.status == self.expected_status && record.locked_by == self.expected_owner
    }

    /// Apply to an in-memory record and bump its version.
    pub fn apply_to(&self, record: &mut DeliveryRecord) {
        record.status = self.status;
        record.retry_count = self.retry_count;
        record.next_retry_at = self.next_retry_at;
        record.locked_by = self.locked_by.clone();
        record.locked_at = self.locked_at;
        record.error_message = self.error_message.clone();
        record.error_code = self.error_code.clone();
        record.updated_at = self.updated_at;
        record.version += 1;
    }
}

/// Insert form of a record; the store assigns `id` and `version`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDeliveryRecord {
    pub batch_id: BatchId,
    pub request_id: RequestId,
    pub file_name: Option<String>,
    pub payload: String,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl NewDeliveryRecord {
    /// Record for a batch whose first delivery just failed.
    pub fn from_failure(
        batch: &BatchPayload,
        error_message: impl Into<String>,
        error_code: impl Into<String>,
        max_retries: u32,
        backoff: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        Ok(Self {
            batch_id: batch.batch_id.clone(),
            request_id: batch.request_id.clone(),
            file_name: batch.source_file_name.clone(),
            payload: batch.to_json()?,
            error_message: Some(error_message.into()),
            error_code: Some(error_code.into()),
            max_retries,
            next_retry_at: Some(backoff.next_retry_at(now, 0)),
            created_at: now,
        })
    }

    pub fn into_record(self, id: RecordId) -> DeliveryRecord {
        DeliveryRecord {
            id,
            batch_id: self.batch_id,
            request_id: self.request_id,
            file_name: self.file_name,
            payload: self.payload,
            error_message: self.error_message,
            error_code: self.error_code,
            retry_count: 0,
            max_retries: self.max_retries,
            status: DeliveryStatus::Pending,
            next_retry_at: self.next_retry_at,
            locked_by: None,
            locked_at: None,
            created_at: self.created_at,
            updated_at: self.created_at,
            version: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    fn backoff() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60)).unwrap()
    }

    fn pending(now: DateTime<Utc>, max_retries: u32) -> DeliveryRecord {
        let batch = BatchPayload::new(BatchId::parse("b-1").unwrap(), vec![]);
        let mut record = NewDeliveryRecord::from_failure(&batch, "boom", "503", max_retries, &backoff(), now)
            .unwrap()
            .into_record(RecordId::new(1));
        record.next_retry_at = None;
        record
    }

    fn owner() -> OwnerId {
        OwnerId::parse("node-a").unwrap()
    }

    #[test]
    fn terminal_states_cannot_move() {
        for to in DeliveryStatus::ALL {
            assert!(DeliveryStatus::Success.transition(to).is_err());
            assert!(DeliveryStatus::Failed.transition(to).is_err());
        }
        assert!(DeliveryStatus::Pending.transition(DeliveryStatus::Retrying).is_err());
        assert!(DeliveryStatus::Pending.transition(DeliveryStatus::Success).is_err());
    }

    #[test]
    fn status_round_trips_through_text() {
        for s in DeliveryStatus::ALL {
            assert_eq!(s.as_str().parse::<DeliveryStatus>().unwrap(), s);
        }
        assert_eq!("failed".parse::<DeliveryStatus>().unwrap(), DeliveryStatus::Failed);
        assert!("DONE".parse::<DeliveryStatus>().is_err());
    }

    #[test]
    fn new_record_is_pending_with_first_backoff() {
        let now = Utc::now();
        let batch = BatchPayload::new(BatchId::parse("b-9").unwrap(), vec![]);
        let new = NewDeliveryRecord::from_failure(&batch, "down", "NETWORK_ERROR", 3, &backoff(), now).unwrap();
        assert_eq!(new.next_retry_at, Some(now + ChronoDuration::seconds(1)));
        let record = new.into_record(RecordId::new(5));
        assert_eq!(record.status, DeliveryStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.decode_payload().unwrap().batch_id.as_str(), "b-9");
    }

    #[test]
    fn attempt_cycle_updates_counters_and_lease() {
        let now = Utc::now();
        let mut record = pending(now, 3);

        let claim = record.claim(&owner(), now).unwrap();
        assert!(claim.matches(&record));
        claim.apply_to(&mut record);
        assert_eq!(record.status, DeliveryStatus::Locked);
        assert_eq!(record.locked_by, Some(owner()));
        assert_eq!(record.version, 1);

        let attempt = record.begin_attempt(&backoff(), now).unwrap();
        assert_eq!(attempt.expected_owner, Some(owner()));
        attempt.apply_to(&mut record);
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.next_retry_at, Some(now + ChronoDuration::seconds(2)));

        let release = record.release(&backoff(), now, "503 Service Unavailable", "503").unwrap();
        release.apply_to(&mut record);
        assert_eq!(record.status, DeliveryStatus::Pending);
        assert!(record.locked_by.is_none() && record.locked_at.is_none());
        assert_eq!(record.next_retry_at, Some(now + ChronoDuration::seconds(2)));
        assert_eq!(record.error_code.as_deref(), Some("503"));
        assert_eq!(record.version, 3);
    }

    #[test]
    fn stale_update_no_longer_matches() {
        let now = Utc::now();
        let mut record = pending(now, 3);
        let first = record.claim(&owner(), now).unwrap();
        first.apply_to(&mut record);
        assert!(!first.matches(&record));
    }

    #[test]
    fn readiness_respects_schedule_lease_and_budget() {
        let now = Utc::now();
        let lease_expiry = now - ChronoDuration::minutes(5);
        let mut record = pending(now, 2);
        assert!(record.is_ready(now, lease_expiry));

        record.next_retry_at = Some(now + ChronoDuration::seconds(1));
        assert!(!record.is_ready(now, lease_expiry));
        record.next_retry_at = None;

        record.status = DeliveryStatus::Locked;
        record.locked_by = Some(owner());
        record.locked_at = Some(now - ChronoDuration::minutes(1));
        assert!(!record.is_ready(now, lease_expiry));

        record.locked_at = Some(now - ChronoDuration::minutes(6));
        assert!(record.is_ready(now, lease_expiry));

        record.retry_count = 2;
        assert!(!record.is_ready(now, lease_expiry));
        assert!(record.is_abandoned(lease_expiry));

        record.status = DeliveryStatus::Failed;
        record.retry_count = 0;
        assert!(!record.is_ready(now, lease_expiry));
    }

    #[test]
    fn success_clears_lease_and_schedule() {
        let now = Utc::now();
        let mut record = pending(now, 3);
        record.claim(&owner(), now).unwrap().apply_to(&mut record);
        record.begin_attempt(&backoff(), now).unwrap().apply_to(&mut record);
        record.succeed(now).unwrap().apply_to(&mut record);
        assert_eq!(record.status, DeliveryStatus::Success);
        assert!(record.next_retry_at.is_none());
        assert!(record.locked_by.is_none());
        assert!(record.succeed(now).is_err());
    }
}
