//! Error classification hooks used by the policies.

/// Tells the policies how to treat an error from the protected call.
pub trait Classify {
    /// Another attempt may succeed (network error, timeout, rejected token).
    fn is_retryable(&self) -> bool;

    /// The error says the downstream is unhealthy and should count against
    /// the circuit breaker. A well-formed 4xx rejection does not.
    fn counts_as_failure(&self) -> bool;
}
