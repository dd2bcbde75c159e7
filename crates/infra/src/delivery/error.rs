use thiserror::Error;

use batchrelay_core::{ErrorCode, FailureClass};
use batchrelay_resilience::Classify;

use crate::credentials::AuthError;

/// Failure of a single delivery attempt.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeliveryError {
    #[error("downstream rejected batch with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("downstream rejected bearer token")]
    TokenRejected,

    #[error("delivery timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("could not obtain auth token: {0}")]
    Auth(#[from] AuthError),
}

impl DeliveryError {
    pub fn failure_class(&self) -> FailureClass {
        match self {
            DeliveryError::Rejected { status, .. } => FailureClass::for_http_status(*status),
            _ => FailureClass::Transient,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            DeliveryError::Rejected { status, .. } => ErrorCode::HttpStatus(*status),
            DeliveryError::TokenRejected => ErrorCode::HttpStatus(401),
            DeliveryError::Timeout(_) | DeliveryError::Network(_) => ErrorCode::Network,
            DeliveryError::Auth(_) => ErrorCode::Authentication,
        }
    }
}

impl Classify for DeliveryError {
    /// Rejected responses are left to the scheduler's backoff.
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeliveryError::TokenRejected
                | DeliveryError::Timeout(_)
                | DeliveryError::Network(_)
                | DeliveryError::Auth(_)
        )
    }

    /// Only downstream-health signals feed the circuit breaker.
    fn counts_as_failure(&self) -> bool {
        match self {
            DeliveryError::Rejected { status, .. } => *status >= 500 || *status == 429,
            DeliveryError::TokenRejected | DeliveryError::Timeout(_) | DeliveryError::Network(_) => true,
            DeliveryError::Auth(_) => false,
        }
    }
}
