//! Outbound delivery: transport, resilient client, first-attempt service.
//!
//! ```text
//! DeliveryService::attempt_delivery
//!   -> IdempotencyGuard
//!   -> ResilientDeliveryClient (rate limiter -> retry -> circuit breaker)
//!        -> TokenProvider + BatchTransport
//!   -> on failure: QueueStore::insert (PENDING)
//! ```

pub mod client;
pub mod error;
pub mod service;
pub mod transport;

pub use client::{BatchDelivery, DeliveryFailure, ResilientDeliveryClient};
pub use error::DeliveryError;
pub use service::{DeliveryOutcome, DeliveryService, DeliveryServiceError};
pub use transport::{BatchTransport, HttpBatchTransport};
