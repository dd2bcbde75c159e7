//! Hot-path overhead of the call-protection policies.

use std::time::Duration;

use batchrelay_resilience::{
    CircuitBreaker, CircuitBreakerConfig, Classify, RateLimiter, RateLimiterConfig,
    ResiliencePipeline, Retry, RetryConfig,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

#[derive(Debug)]
struct Never;

impl std::fmt::Display for Never {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("never")
    }
}

impl Classify for Never {
    fn is_retryable(&self) -> bool {
        false
    }

    fn counts_as_failure(&self) -> bool {
        false
    }
}

fn pipeline() -> ResiliencePipeline {
    ResiliencePipeline::new(
        RateLimiter::new(
            "bench",
            RateLimiterConfig {
                limit_for_period: u32::MAX,
                refresh_period: Duration::from_secs(1),
            },
        ),
        Retry::new("bench", RetryConfig::default()),
        CircuitBreaker::new("bench", CircuitBreakerConfig::default()),
    )
}

fn bench_policies(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();

    let p = pipeline();
    c.bench_function("pipeline_execute_success", |b| {
        b.iter(|| {
            rt.block_on(async {
                let r = p.execute(|| async { Ok::<_, Never>(black_box(1u32)) }).await;
                black_box(r).unwrap()
            })
        })
    });

    let breaker = CircuitBreaker::new("bench", CircuitBreakerConfig::default());
    c.bench_function("breaker_acquire_record", |b| {
        b.iter(|| {
            if let Some(permit) = breaker.try_acquire() {
                permit.record(black_box(false));
            }
        })
    });

    let limiter = RateLimiter::new(
        "bench",
        RateLimiterConfig {
            limit_for_period: u32::MAX,
            refresh_period: Duration::from_secs(1),
        },
    );
    c.bench_function("limiter_try_acquire", |b| b.iter(|| black_box(limiter.try_acquire())));
}

criterion_group!(benches, bench_policies);
criterion_main!(benches);
