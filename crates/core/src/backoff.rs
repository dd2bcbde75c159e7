//! Retry scheduling policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Exponential per-record backoff: `min(base * 2^retry_count, max)`.
///
/// Deterministic given the retry count; spreading load across instances is
/// the job of [`PollJitter`], not of the per-record delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    /// `base_delay` must be non-zero and not larger than `max_delay`.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Result<Self, DomainError> {
        if base_delay.is_zero() {
            return Err(DomainError::validation("backoff base delay must be > 0"));
        }
        if base_delay > max_delay {
            return Err(DomainError::validation(
                "backoff base delay must not exceed max delay",
            ));
        }
        Ok(Self {
            base_delay,
            max_delay,
        })
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Delay before the attempt following `retry_count` previous attempts.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn next_retry_at(&self, now: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay(retry_count))
            .unwrap_or_else(|_| chrono::Duration::milliseconds(self.max_delay.as_millis() as i64));
        now + delay
    }
}

/// Randomised scheduler poll interval: `base + uniform[0, jitter)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollJitter {
    pub base: Duration,
    pub jitter: Duration,
}

impl Default for PollJitter {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            jitter: Duration::from_secs(10),
        }
    }
}

impl PollJitter {
    pub fn new(base: Duration, jitter: Duration) -> Self {
        Self { base, jitter }
    }

    pub fn next_interval(&self) -> Duration {
        self.next_interval_with(&mut rand::thread_rng())
    }

    pub fn next_interval_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.base;
        }
        self.base + Duration::from_millis(rng.gen_range(0..jitter_ms))
    }
}
