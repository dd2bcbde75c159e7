//! Infrastructure layer: durable queue, shared cache, credentials, outbound
//! delivery, the retry scheduler and runtime configuration.

pub mod config;
pub mod credentials;
pub mod delivery;
pub mod idempotency;
pub mod kv;
pub mod lease;
pub mod scheduler;
pub mod shutdown;
pub mod store;


pub use config::{ConfigError, RelayConfig};
pub use credentials::{
    AuthError, CredentialCache, CredentialSettings, HttpTokenSource, IssuedToken, TokenProvider,
    TokenSource,
};
pub use delivery::{
    BatchDelivery, BatchTransport, DeliveryError, DeliveryFailure, DeliveryOutcome, DeliveryService,
    DeliveryServiceError, HttpBatchTransport, ResilientDeliveryClient,
};
pub use idempotency::IdempotencyGuard;
pub use kv::{CacheError, DistributedLock, InMemoryCache, SharedCache};
pub use lease::LeaseManager;
pub use scheduler::{RetryScheduler, SchedulerConfig, TickReport};
pub use shutdown::{DrainOutcome, InFlightGuard, ShutdownCoordinator};
pub use store::{InMemoryQueueStore, PostgresQueueStore, QueueStats, QueueStore, QueueStoreError};
