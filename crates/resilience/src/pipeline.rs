//! Composition of the three policies around one logical call.

use std::future::Future;

use crate::circuit_breaker::CircuitBreaker;
use crate::classify::Classify;
use crate::error::PolicyError;
use crate::rate_limiter::RateLimiter;
use crate::retry::Retry;

/// `rate limiter -> retry -> circuit breaker -> call`.
///
/// One limiter permit per logical call; every attempt made by the retry
/// policy goes through the breaker; a breaker short-circuit is not retried.
#[derive(Debug)]
pub struct ResiliencePipeline {
    limiter: RateLimiter,
    retry: Retry,
    breaker: CircuitBreaker,
}

impl ResiliencePipeline {
    pub fn new(limiter: RateLimiter, retry: Retry, breaker: CircuitBreaker) -> Self {
        Self {
            limiter,
            retry,
            breaker,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn retry(&self) -> &Retry {
        &self.retry
    }

    /// `attempt` is invoked once per try and must build a fresh future each time.
    pub async fn execute<T, E, F, Fut>(&self, mut attempt: F) -> Result<T, PolicyError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::fmt::Display,
    {
        if !self.limiter.try_acquire() {
            return Err(PolicyError::RateLimited);
        }
        self.retry.call(|| self.breaker.call(attempt())).await
    }
}
