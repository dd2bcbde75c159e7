//! Retry scheduler: the control loop that drives queued records to a terminal
//! state.
//!
//! Each tick sweeps abandoned leases, claims up to `batch_size` ready records
//! and processes them concurrently (at most `concurrency` at a time):
//!
//! ```text
//! LOCKED --begin_attempt--> RETRYING --deliver--> SUCCESS
//!                                     \--terminal / exhausted--> FAILED
//!                                     \--transient--> PENDING (+backoff)
//! ```
//!
//! Every write is a compare-and-swap on status, owner and version. A conflict
//! means the lease was lost to another owner; the record is left alone.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use batchrelay_core::{BackoffPolicy, Clock, DeliveryRecord, ErrorCode, PollJitter};

use crate::delivery::BatchDelivery;
use crate::lease::LeaseManager;
use crate::shutdown::ShutdownCoordinator;
use crate::store::{QueueStore, QueueStoreError};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Records claimed per tick.
    pub batch_size: usize,
    /// Records processed concurrently within a tick.
    pub concurrency: usize,
    pub poll: PollJitter,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            concurrency: 10,
            poll: PollJitter::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_poll(mut self, poll: PollJitter) -> Self {
        self.poll = poll;
        self
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub claimed: usize,
    pub delivered: usize,
    pub rescheduled: usize,
    pub failed: usize,
    pub conflicts: usize,
    pub errors: usize,
    pub abandoned_failed: u64,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.claimed == 0 && self.abandoned_failed == 0
    }

    fn record(&mut self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Delivered => self.delivered += 1,
            RecordOutcome::Rescheduled => self.rescheduled += 1,
            RecordOutcome::Failed => self.failed += 1,
            RecordOutcome::Conflict => self.conflicts += 1,
            RecordOutcome::Error => self.errors += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOutcome {
    Delivered,
    Rescheduled,
    Failed,
    Conflict,
    Error,
}

pub struct RetryScheduler<S, D> {
    lease: LeaseManager<S>,
    delivery: D,
    backoff: BackoffPolicy,
    config: SchedulerConfig,
    shutdown: ShutdownCoordinator,
    clock: Arc<dyn Clock>,
}

impl<S, D> RetryScheduler<S, D>
where
    S: QueueStore,
    D: BatchDelivery,
{
    pub fn new(
        lease: LeaseManager<S>,
        delivery: D,
        backoff: BackoffPolicy,
        config: SchedulerConfig,
        shutdown: ShutdownCoordinator,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            lease,
            delivery,
            backoff,
            config,
            shutdown,
            clock,
        }
    }

    pub fn lease(&self) -> &LeaseManager<S> {
        &self.lease
    }

    /// Run one tick. Never fails: coordination errors end the tick early and
    /// per-record errors are isolated to that record.
    pub async fn run_once(&self) -> TickReport {
        let mut report = TickReport::default();
        let owner = self.lease.owner();

        match self.lease.sweep_abandoned(self.clock.now()).await {
            Ok(n) => report.abandoned_failed = n,
            Err(e) => {
                warn!(owner = %owner, error = %e, "abandoned lease sweep failed; retrying next tick");
                return report;
            }
        }

        if self.shutdown.is_shutting_down() {
            return report;
        }

        let records = match self.lease.claim(self.clock.now(), self.config.batch_size).await {
            Ok(records) => records,
            Err(e) => {
                warn!(owner = %owner, error = %e, "claim failed; retrying next tick");
                return report;
            }
        };
        report.claimed = records.len();

        let outcomes = Mutex::new(report);
        futures::stream::iter(records)
            .for_each_concurrent(self.config.concurrency.max(1), |record| {
                let outcomes = &outcomes;
                async move {
                    let outcome = self.process_record(record).await;
                    outcomes.lock().unwrap_or_else(|e| e.into_inner()).record(outcome);
                }
            })
            .await;
        outcomes.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    async fn process_record(&self, record: DeliveryRecord) -> RecordOutcome {
        let _in_flight = self.shutdown.track();
        let record_id = record.id;
        let batch_id = record.batch_id.clone();

        match self.attempt(record).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_conflict() => {
                warn!(record_id = %record_id, batch_id = %batch_id, error = %e, "lease lost; skipping record");
                RecordOutcome::Conflict
            }
            Err(e) => {
                error!(record_id = %record_id, batch_id = %batch_id, error = %e, "failed to process record");
                RecordOutcome::Error
            }
        }
    }

    async fn attempt(&self, record: DeliveryRecord) -> Result<RecordOutcome, QueueStoreError> {
        let store = self.lease.store();
        let update = record.begin_attempt(&self.backoff, self.clock.now())?;
        let record = store.update_state(record.id, &update, Some(record.version)).await?;
        debug!(
            record_id = %record.id,
            batch_id = %record.batch_id,
            retry_count = record.retry_count,
            "retry attempt started"
        );

        let batch = match record.decode_payload() {
            Ok(batch) => batch,
            Err(e) => {
                let code = ErrorCode::Deserialization.to_string();
                let update = record.fail(self.clock.now(), e.to_string(), &code)?;
                store.update_state(record.id, &update, Some(record.version)).await?;
                error!(record_id = %record.id, batch_id = %record.batch_id, error = %e, "undecodable payload; record failed");
                return Ok(RecordOutcome::Failed);
            }
        };

        let failure = match self.delivery.deliver(&batch).await {
            Ok(()) => {
                let update = record.succeed(self.clock.now())?;
                store.update_state(record.id, &update, Some(record.version)).await?;
                info!(
                    record_id = %record.id,
                    batch_id = %record.batch_id,
                    retry_count = record.retry_count,
                    "batch delivered on retry"
                );
                return Ok(RecordOutcome::Delivered);
            }
            Err(failure) => failure,
        };

        let code = failure.code.to_string();
        if failure.class.is_terminal() || record.retries_exhausted() {
            let update = record.fail(self.clock.now(), &failure.message, &code)?;
            store.update_state(record.id, &update, Some(record.version)).await?;
            error!(
                record_id = %record.id,
                batch_id = %record.batch_id,
                retry_count = record.retry_count,
                error_code = %code,
                error = %failure.message,
                "batch delivery failed permanently"
            );
            return Ok(RecordOutcome::Failed);
        }

        let update = record.release(&self.backoff, self.clock.now(), &failure.message, &code)?;
        let record = store.update_state(record.id, &update, Some(record.version)).await?;
        info!(
            record_id = %record.id,
            batch_id = %record.batch_id,
            retry_count = record.retry_count,
            error_code = %code,
            next_retry_at = ?record.next_retry_at,
            "batch rescheduled"
        );
        Ok(RecordOutcome::Rescheduled)
    }

    /// Tick on a jittered interval until shutdown is signalled. The tick in
    /// progress when the signal arrives runs to completion.
    pub async fn run(&self) {
        let mut stop = self.shutdown.subscribe();
        info!(owner = %self.lease.owner(), "retry scheduler started");
        loop {
            if *stop.borrow() {
                break;
            }
            let report = self.run_once().await;
            if !report.is_empty() {
                info!(
                    claimed = report.claimed,
                    delivered = report.delivered,
                    rescheduled = report.rescheduled,
                    failed = report.failed,
                    conflicts = report.conflicts,
                    errors = report.errors,
                    abandoned_failed = report.abandoned_failed,
                    "retry tick complete"
                );
            }

            let wait = self.config.poll.next_interval();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(owner = %self.lease.owner(), "retry scheduler stopped");
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()>
    where
        S: 'static,
        D: 'static,
    {
        tokio::spawn(async move { self.run().await })
    }
}
