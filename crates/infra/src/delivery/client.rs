use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use batchrelay_core::{BatchPayload, ErrorCode, FailureClass};
use batchrelay_resilience::{PolicyError, ResiliencePipeline};

use super::error::DeliveryError;
use super::transport::BatchTransport;
use crate::credentials::TokenProvider;

/// A delivery that did not succeed, as seen by the record owner.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryFailure {
    pub class: FailureClass,
    pub code: ErrorCode,
    pub message: String,
}

impl DeliveryFailure {
    pub fn new(class: FailureClass, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            class,
            code,
            message: message.into(),
        }
    }
}

impl From<PolicyError<DeliveryError>> for DeliveryFailure {
    fn from(err: PolicyError<DeliveryError>) -> Self {
        match err {
            PolicyError::RateLimited => Self::new(
                FailureClass::CapacityRejected,
                ErrorCode::RateLimited,
                "rate limit exceeded",
            ),
            PolicyError::CircuitOpen => Self::new(
                FailureClass::CapacityRejected,
                ErrorCode::CircuitOpen,
                "circuit breaker is open",
            ),
            PolicyError::Inner(e) => Self::new(e.failure_class(), e.error_code(), e.to_string()),
        }
    }
}

/// Delivers one batch, all protections included.
#[async_trait]
pub trait BatchDelivery: Send + Sync {
    async fn deliver(&self, batch: &BatchPayload) -> Result<(), DeliveryFailure>;
}

#[async_trait]
impl<D: BatchDelivery + ?Sized> BatchDelivery for Arc<D> {
    async fn deliver(&self, batch: &BatchPayload) -> Result<(), DeliveryFailure> {
        (**self).deliver(batch).await
    }
}

/// Fetches a token before every attempt so a retry after a 401 picks up a
/// token refreshed elsewhere in the meantime.
pub struct ResilientDeliveryClient<T, P> {
    transport: T,
    tokens: P,
    pipeline: ResiliencePipeline,
}

impl<T, P> ResilientDeliveryClient<T, P>
where
    T: BatchTransport,
    P: TokenProvider,
{
    pub fn new(transport: T, tokens: P, pipeline: ResiliencePipeline) -> Self {
        Self {
            transport,
            tokens,
            pipeline,
        }
    }

    pub fn pipeline(&self) -> &ResiliencePipeline {
        &self.pipeline
    }
}

#[async_trait]
impl<T, P> BatchDelivery for ResilientDeliveryClient<T, P>
where
    T: BatchTransport,
    P: TokenProvider,
{
    async fn deliver(&self, batch: &BatchPayload) -> Result<(), DeliveryFailure> {
        let result = self
            .pipeline
            .execute(|| async move {
                let token = self.tokens.token().await?;
                let result = self.transport.send(batch, &token).await;
                if matches!(result, Err(DeliveryError::TokenRejected)) {
                    if let Err(e) = self.tokens.reject(&token).await {
                        warn!(batch_id = %batch.batch_id, error = %e, "failed to evict rejected token");
                    }
                }
                result
            })
            .await;

        match result {
            Ok(()) => {
                info!(batch_id = %batch.batch_id, records = batch.record_count(), "batch delivered");
                Ok(())
            }
            Err(e) => {
                let failure = DeliveryFailure::from(e);
                warn!(
                    batch_id = %batch.batch_id,
                    error_code = %failure.code,
                    class = ?failure.class,
                    error = %failure.message,
                    "batch delivery failed"
                );
                Err(failure)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use batchrelay_core::BatchId;
    use batchrelay_resilience::{
        CircuitBreaker, CircuitBreakerConfig, RateLimiter, RateLimiterConfig, Retry, RetryConfig,
    };

    use crate::credentials::AuthError;

    struct ScriptedTransport {
        replies: Mutex<Vec<Result<(), DeliveryError>>>,
        tokens_seen: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(mut replies: Vec<Result<(), DeliveryError>>) -> Self {
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                tokens_seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BatchTransport for ScriptedTransport {
        async fn send(&self, _batch: &BatchPayload, token: &str) -> Result<(), DeliveryError> {
            self.tokens_seen.lock().unwrap().push(token.to_string());
            self.replies.lock().unwrap().pop().unwrap_or(Ok(()))
        }
    }

    struct RotatingTokens(AtomicU32);

    #[async_trait]
    impl TokenProvider for RotatingTokens {
        async fn token(&self) -> Result<String, AuthError> {
            Ok(format!("t{}", self.0.fetch_add(1, Ordering::SeqCst)))
        }
    }

    /// Serves the same token until it is rejected.
    struct StickyTokens {
        generation: AtomicU32,
        rejected: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TokenProvider for StickyTokens {
        async fn token(&self) -> Result<String, AuthError> {
            Ok(format!("t{}", self.generation.load(Ordering::SeqCst)))
        }

        async fn reject(&self, token: &str) -> Result<(), AuthError> {
            self.rejected.lock().unwrap().push(token.to_string());
            self.generation.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct NoTokens;

    #[async_trait]
    impl TokenProvider for NoTokens {
        async fn token(&self) -> Result<String, AuthError> {
            Err(AuthError::LockTimeout)
        }
    }

    fn pipeline() -> ResiliencePipeline {
        ResiliencePipeline::new(
            RateLimiter::new("test", RateLimiterConfig::default()),
            Retry::new("test", RetryConfig::fixed(3, Duration::from_millis(10))),
            CircuitBreaker::new("test", CircuitBreakerConfig::default()),
        )
    }

    fn batch() -> BatchPayload {
        BatchPayload::new(BatchId::parse("b-1").unwrap(), vec![])
    }

    #[tokio::test(start_paused = true)]
    async fn token_rejection_retries_with_a_fresh_token() {
        let transport = ScriptedTransport::new(vec![Err(DeliveryError::TokenRejected), Ok(())]);
        let client = ResilientDeliveryClient::new(transport, RotatingTokens(AtomicU32::new(0)), pipeline());
        client.deliver(&batch()).await.unwrap();
        assert_eq!(*client.transport.tokens_seen.lock().unwrap(), vec!["t0", "t1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn token_rejection_evicts_the_cached_token_before_retrying() {
        let transport = ScriptedTransport::new(vec![Err(DeliveryError::TokenRejected), Ok(())]);
        let tokens = StickyTokens {
            generation: AtomicU32::new(0),
            rejected: Mutex::new(Vec::new()),
        };
        let client = ResilientDeliveryClient::new(transport, tokens, pipeline());
        client.deliver(&batch()).await.unwrap();
        assert_eq!(*client.transport.tokens_seen.lock().unwrap(), vec!["t0", "t1"]);
        assert_eq!(*client.tokens.rejected.lock().unwrap(), vec!["t0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_surfaces_status_without_retry() {
        let transport = ScriptedTransport::new(vec![Err(DeliveryError::Rejected {
            status: 400,
            body: "bad".into(),
        })]);
        let client = ResilientDeliveryClient::new(transport, RotatingTokens(AtomicU32::new(0)), pipeline());
        let failure = client.deliver(&batch()).await.unwrap_err();
        assert_eq!(failure.class, FailureClass::Terminal);
        assert_eq!(failure.code, ErrorCode::HttpStatus(400));
        assert_eq!(client.transport.tokens_seen.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_token_is_an_authentication_failure() {
        let transport = ScriptedTransport::new(vec![]);
        let client = ResilientDeliveryClient::new(transport, NoTokens, pipeline());
        let failure = client.deliver(&batch()).await.unwrap_err();
        assert_eq!(failure.class, FailureClass::Transient);
        assert_eq!(failure.code, ErrorCode::Authentication);
        assert!(client.transport.tokens_seen.lock().unwrap().is_empty());
    }

    #[test]
    fn policy_rejections_are_capacity_failures() {
        let limited = DeliveryFailure::from(PolicyError::<DeliveryError>::RateLimited);
        assert_eq!(limited.class, FailureClass::CapacityRejected);
        assert_eq!(limited.code.to_string(), "RATE_LIMIT_EXCEEDED");
        let open = DeliveryFailure::from(PolicyError::<DeliveryError>::CircuitOpen);
        assert_eq!(open.code.to_string(), "CIRCUIT_BREAKER_OPEN");
    }
}
