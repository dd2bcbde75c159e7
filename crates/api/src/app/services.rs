//! Service wiring shared by the HTTP handlers and the retry scheduler.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use batchrelay_core::{BackoffPolicy, Clock, OwnerId, SystemClock};
use batchrelay_infra::{
    kv::{DistributedLock, RedisCache},
    store::postgres,
    BatchDelivery, CredentialCache, DeliveryService, HttpBatchTransport, HttpTokenSource,
    IdempotencyGuard, InMemoryCache, InMemoryQueueStore, LeaseManager, PostgresQueueStore,
    QueueStore, RelayConfig, ResilientDeliveryClient, RetryScheduler, SharedCache,
    ShutdownCoordinator,
};

pub type DynDeliveryService =
    DeliveryService<Arc<dyn BatchDelivery>, Arc<dyn QueueStore>, Arc<dyn SharedCache>>;

pub type DynRetryScheduler = RetryScheduler<Arc<dyn QueueStore>, Arc<dyn BatchDelivery>>;

/// State handed to every handler.
pub struct AppServices {
    deliveries: DynDeliveryService,
}

impl AppServices {
    pub fn new(deliveries: DynDeliveryService) -> Self {
        Self { deliveries }
    }

    /// In-process backends: an in-memory queue and cache around `delivery`.
    pub fn in_memory(
        delivery: Arc<dyn BatchDelivery>,
        backoff: BackoffPolicy,
        max_retries: u32,
    ) -> Self {
        let store: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::new());
        let cache: Arc<dyn SharedCache> = Arc::new(InMemoryCache::new());
        Self::new(DeliveryService::new(
            delivery,
            store,
            IdempotencyGuard::new(cache, batchrelay_infra::idempotency::DEFAULT_MARKER_TTL),
            ShutdownCoordinator::new(),
            backoff,
            max_retries,
            Arc::new(SystemClock),
        ))
    }

    pub fn deliveries(&self) -> &DynDeliveryService {
        &self.deliveries
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        self.deliveries.store()
    }

    pub fn shutdown(&self) -> &ShutdownCoordinator {
        self.deliveries.shutdown()
    }
}

/// Everything `main` needs to run the process.
pub struct Runtime {
    pub services: Arc<AppServices>,
    pub scheduler: Arc<DynRetryScheduler>,
}

/// Connect to Postgres and Redis and wire the production delivery path.
///
/// The consumer path and the scheduler share one delivery client, so they
/// also share its circuit breaker and rate limiter.
pub async fn build_services(config: &RelayConfig) -> anyhow::Result<Runtime> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let backoff = config.backoff().context("invalid backoff settings")?;

    let pool = postgres::connect(&config.postgres())
        .await
        .context("failed to connect to postgres")?;
    let pg = PostgresQueueStore::new(pool);
    pg.ensure_schema()
        .await
        .context("failed to create delivery_records schema")?;
    let store: Arc<dyn QueueStore> = Arc::new(pg);

    let redis = RedisCache::connect(&config.redis_url)
        .await
        .context("failed to connect to redis")?;

    let http = HttpBatchTransport::build_client(config.http_connect_timeout, config.http_request_timeout)
        .context("failed to build http client")?;

    let token_source = HttpTokenSource::new(
        http.clone(),
        config.auth_url.clone(),
        config.auth_username.clone(),
        config.auth_password.clone(),
    );
    let credentials = CredentialCache::new(
        redis.clone(),
        DistributedLock::new(redis.clone(), config.lock_lease, config.lock_poll),
        token_source,
        config.credentials(),
        clock.clone(),
    );
    let delivery: Arc<dyn BatchDelivery> = Arc::new(ResilientDeliveryClient::new(
        HttpBatchTransport::new(http, config.upload_url.clone()),
        credentials,
        config.pipeline(),
    ));

    let cache: Arc<dyn SharedCache> = Arc::new(redis);
    let shutdown = ShutdownCoordinator::new();

    let owner = OwnerId::generate();
    info!(owner = %owner, "retry scheduler owner assigned");
    let scheduler = RetryScheduler::new(
        LeaseManager::new(store.clone(), owner, config.lease_timeout),
        delivery.clone(),
        backoff,
        config.scheduler(),
        shutdown.clone(),
        clock.clone(),
    );

    let deliveries = DeliveryService::new(
        delivery,
        store,
        IdempotencyGuard::new(cache, config.idempotency_ttl),
        shutdown,
        backoff,
        config.max_retries,
        clock,
    );

    Ok(Runtime {
        services: Arc::new(AppServices::new(deliveries)),
        scheduler: Arc::new(scheduler),
    })
}
