//! `batchrelay-core`: delivery domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the delivery record and its status state machine, the batch
//! payload exchanged with producers, and the backoff policy.

pub mod backoff;
pub mod clock;
pub mod error;
pub mod failure;
pub mod id;
pub mod payload;
pub mod record;

pub use backoff::{BackoffPolicy, PollJitter};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use failure::{ErrorCode, FailureClass};
pub use id::{BatchId, OwnerId, RecordId, RequestId};
pub use payload::BatchPayload;
pub use record::{DeliveryRecord, DeliveryStatus, NewDeliveryRecord, RecordUpdate};
