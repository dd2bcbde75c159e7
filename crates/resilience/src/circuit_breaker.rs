//! Count-based circuit breaker.
//!
//! CLOSED records the last `window_size` outcomes and opens once at least
//! `minimum_calls` are buffered and either the failure rate or the slow-call
//! rate is strictly above its threshold. OPEN rejects everything until
//! `open_wait` has elapsed, then the next admission check moves it to
//! HALF_OPEN, which admits `permitted_calls_in_half_open` concurrent trial calls.
//! Any failed trial reopens the breaker; that many successful trials close it.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::classify::Classify;
use crate::error::PolicyError;

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    pub window_size: usize,
    pub minimum_calls: usize,
    /// Percentage in (0, 100].
    pub failure_rate_threshold: f64,
    /// Percentage in (0, 100].
    pub slow_call_rate_threshold: f64,
    pub slow_call_duration: Duration,
    pub open_wait: Duration,
    pub permitted_calls_in_half_open: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            minimum_calls: 10,
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 50.0,
            slow_call_duration: Duration::from_secs(10),
            open_wait: Duration::from_secs(30),
            permitted_calls_in_half_open: 5,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub buffered_calls: usize,
    pub failed_calls: usize,
    pub slow_calls: usize,
    pub failure_rate: f64,
    pub slow_call_rate: f64,
}

#[derive(Debug, Copy, Clone)]
struct Outcome {
    failed: bool,
    slow: bool,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    /// Bumped on every state change; outcomes from an older generation are dropped.
    generation: u64,
    window: VecDeque<Outcome>,
    opened_at: Option<Instant>,
    trials_in_flight: usize,
    trial_successes: usize,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let window = VecDeque::with_capacity(config.window_size);
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                generation: 0,
                window,
                opened_at: None,
                trials_in_flight: 0,
                trial_successes: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state, applying the OPEN -> HALF_OPEN timeout if it has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner, Instant::now());
        inner.state
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner, Instant::now());
        let buffered = inner.window.len();
        let failed = inner.window.iter().filter(|o| o.failed).count();
        let slow = inner.window.iter().filter(|o| o.slow).count();
        CircuitBreakerMetrics {
            state: inner.state,
            buffered_calls: buffered,
            failed_calls: failed,
            slow_calls: slow,
            failure_rate: rate(failed, buffered),
            slow_call_rate: rate(slow, buffered),
        }
    }

    /// Run `call` if the breaker admits it and record the outcome.
    pub async fn call<T, E, Fut>(&self, call: Fut) -> Result<T, PolicyError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        let permit = self.try_acquire().ok_or(PolicyError::CircuitOpen)?;
        let result = call.await;
        let failed = match &result {
            Ok(_) => false,
            Err(e) => e.counts_as_failure(),
        };
        permit.record(failed);
        result.map_err(PolicyError::Inner)
    }

    /// Ask for admission. `None` means short-circuit.
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let now = Instant::now();
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner, now);
        let half_open = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => return None,
            CircuitState::HalfOpen => {
                if inner.trials_in_flight >= self.config.permitted_calls_in_half_open {
                    return None;
                }
                inner.trials_in_flight += 1;
                true
            }
        };
        Some(Permit {
            breaker: self,
            generation: inner.generation,
            half_open,
            started: now,
            recorded: false,
        })
    }

    fn maybe_half_open(&self, inner: &mut Inner, now: Instant) {
        if inner.state != CircuitState::Open {
            return;
        }
        let waited = inner
            .opened_at
            .is_none_or(|at| now.saturating_duration_since(at) >= self.config.open_wait);
        if waited {
            self.transition(inner, CircuitState::HalfOpen, now);
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.window.clear();
        inner.trials_in_flight = 0;
        inner.trial_successes = 0;
        inner.opened_at = (to == CircuitState::Open).then_some(now);
        match to {
            CircuitState::Open => warn!(
                breaker = %self.name,
                from = from.as_str(),
                open_wait_ms = self.config.open_wait.as_millis() as u64,
                "circuit breaker opened"
            ),
            _ => info!(
                breaker = %self.name,
                from = from.as_str(),
                to = to.as_str(),
                "circuit breaker state changed"
            ),
        }
    }

    fn on_result(&self, generation: u64, half_open: bool, started: Instant, failed: bool) {
        let now = Instant::now();
        let slow = now.saturating_duration_since(started) >= self.config.slow_call_duration;
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        match inner.state {
            CircuitState::Open => {}
            CircuitState::HalfOpen => {
                if half_open {
                    inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
                }
                if failed || slow {
                    self.transition(&mut inner, CircuitState::Open, now);
                } else {
                    inner.trial_successes += 1;
                    if inner.trial_successes >= self.config.permitted_calls_in_half_open {
                        self.transition(&mut inner, CircuitState::Closed, now);
                    }
                }
            }
            CircuitState::Closed => {
                inner.window.push_back(Outcome { failed, slow });
                while inner.window.len() > self.config.window_size {
                    inner.window.pop_front();
                }
                if self.threshold_exceeded(&inner) {
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
        }
    }

    fn threshold_exceeded(&self, inner: &Inner) -> bool {
        let buffered = inner.window.len();
        if buffered < self.config.minimum_calls {
            return false;
        }
        let failed = inner.window.iter().filter(|o| o.failed).count();
        let slow = inner.window.iter().filter(|o| o.slow).count();
        rate(failed, buffered) > self.config.failure_rate_threshold
            || rate(slow, buffered) > self.config.slow_call_rate_threshold
    }

    fn release_trial(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation == generation && inner.state == CircuitState::HalfOpen {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }
    }
}

fn rate(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 * 100.0 / total as f64
    }
}

/// Admission ticket for one call. Dropping it unrecorded (e.g. the call was
/// cancelled) frees its half-open slot without counting an outcome.
#[derive(Debug)]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    half_open: bool,
    started: Instant,
    recorded: bool,
}

impl Permit<'_> {
    pub fn record(mut self, failed: bool) {
        self.recorded = true;
        self.breaker
            .on_result(self.generation, self.half_open, self.started, failed);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.recorded && self.half_open {
            self.breaker.release_trial(self.generation);
        }
    }
}
