//! Fixed-period permit limiter with zero wait tolerance.
//!
//! `limit_for_period` permits become available at the start of every
//! `refresh_period`; unused permits do not carry over. A caller that finds no
//! permit is rejected immediately rather than queued.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    pub limit_for_period: u32,
    pub refresh_period: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            limit_for_period: 100,
            refresh_period: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
struct Window {
    started: Instant,
    used: u32,
}

#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    config: RateLimiterConfig,
    window: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Self {
        Self {
            name: name.into(),
            config,
            window: Mutex::new(Window {
                started: Instant::now(),
                used: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn current(&self, now: Instant) -> MutexGuard<'_, Window> {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed = now.saturating_duration_since(window.started);
        if elapsed >= self.config.refresh_period {
            // Align to period boundaries so bursts cannot straddle a reset.
            let period = self.config.refresh_period.as_nanos().max(1);
            let cycles = elapsed.as_nanos() / period;
            let advance = Duration::from_nanos((cycles * period).min(u64::MAX as u128) as u64);
            window.started += advance;
            window.used = 0;
        }
        window
    }

    /// Take one permit if available.
    pub fn try_acquire(&self) -> bool {
        let mut window = self.current(Instant::now());
        if window.used < self.config.limit_for_period {
            window.used += 1;
            true
        } else {
            debug!(limiter = %self.name, limit = self.config.limit_for_period, "rate limit exceeded");
            false
        }
    }

    pub fn available_permits(&self) -> u32 {
        let window = self.current(Instant::now());
        self.config.limit_for_period.saturating_sub(window.used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn hundred_and_first_call_in_window_is_rejected() {
        let limiter = RateLimiter::new("test", RateLimiterConfig::default());
        for i in 0..100 {
            assert!(limiter.try_acquire(), "permit {i}");
        }
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.available_permits(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn permits_refresh_each_period_without_carry_over() {
        let limiter = RateLimiter::new(
            "test",
            RateLimiterConfig {
                limit_for_period: 2,
                refresh_period: Duration::from_secs(1),
            },
        );
        assert!(limiter.try_acquire());
        tokio::time::advance(Duration::from_millis(2_500)).await;
        assert_eq!(limiter.available_permits(), 2);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        // 2.5s after start is mid-period; the next refresh is at 3s.
        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(!limiter.try_acquire());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(limiter.try_acquire());
    }
}
