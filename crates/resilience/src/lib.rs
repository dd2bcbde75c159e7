//! Call-protection policies: circuit breaker, rate limiter, retry.
//!
//! Each policy is transport-agnostic and wraps a future. [`ResiliencePipeline`]
//! composes them as `rate limiter -> retry -> circuit breaker -> call`, so a
//! call rejected by the limiter never reaches breaker statistics and every
//! retried attempt is observed by the breaker.

pub mod circuit_breaker;
pub mod classify;
pub mod error;
pub mod pipeline;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState};
pub use classify::Classify;
pub use error::PolicyError;
pub use pipeline::ResiliencePipeline;
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use retry::{Retry, RetryConfig};
