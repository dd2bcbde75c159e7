//! Errors surfaced by the policies.

use thiserror::Error;

/// Outcome of a protected call that did not succeed.
///
/// `RateLimited` and `CircuitOpen` mean the call was never attempted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError<E> {
    #[error("rate limit exceeded")]
    RateLimited,

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error(transparent)]
    Inner(E),
}

impl<E> PolicyError<E> {
    /// True when no attempt reached the protected call.
    pub fn is_rejected(&self) -> bool {
        matches!(self, PolicyError::RateLimited | PolicyError::CircuitOpen)
    }

    pub fn inner(&self) -> Option<&E> {
        match self {
            PolicyError::Inner(e) => Some(e),
            _ => None,
        }
    }

    pub fn map_inner<F, O>(self, f: F) -> PolicyError<O>
    where
        F: FnOnce(E) -> O,
    {
        match self {
            PolicyError::RateLimited => PolicyError::RateLimited,
            PolicyError::CircuitOpen => PolicyError::CircuitOpen,
            PolicyError::Inner(e) => PolicyError::Inner(f(e)),
        }
    }
}
