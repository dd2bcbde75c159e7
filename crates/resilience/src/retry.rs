//! Bounded retry of classified-transient failures.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::classify::Classify;
use crate::error::PolicyError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub wait: Duration,
    /// 1.0 keeps the wait fixed; larger values grow it per attempt.
    pub multiplier: f64,
    pub max_wait: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            wait: Duration::from_secs(2),
            multiplier: 1.0,
            max_wait: Duration::from_secs(2),
        }
    }
}

impl RetryConfig {
    pub fn fixed(max_attempts: u32, wait: Duration) -> Self {
        Self {
            max_attempts,
            wait,
            multiplier: 1.0,
            max_wait: wait,
        }
    }

    pub fn exponential(max_attempts: u32, wait: Duration, max_wait: Duration) -> Self {
        Self {
            max_attempts,
            wait,
            multiplier: 2.0,
            max_wait,
        }
    }

    /// Wait after the given (1-indexed) failed attempt.
    ///
    /// Grown in f64 and capped before converting back, so huge exponents and
    /// non-finite multipliers saturate at the cap.
    pub fn wait_after(&self, attempt: u32) -> Duration {
        let cap = self.max_wait.max(self.wait);
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(self.wait.as_secs_f64() * factor)
            .unwrap_or(cap)
            .min(cap)
    }
}

#[derive(Debug)]
pub struct Retry {
    name: String,
    config: RetryConfig,
}

impl Retry {
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget runs out. Policy rejections are returned as-is.
    pub async fn call<T, E, F, Fut>(&self, mut op: F) -> Result<T, PolicyError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PolicyError<E>>>,
        E: Classify + std::fmt::Display,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(PolicyError::Inner(e)) if e.is_retryable() && attempt < max_attempts => {
                    let wait = self.config.wait_after(attempt);
                    debug!(
                        retry = %self.name,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
