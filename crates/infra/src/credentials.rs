//! Distributed bearer-token cache with single-flight refresh.
//!
//! All instances read the same cached token. When it is missing or within the
//! safety buffer of expiry, callers contend for one refresh lock; the winner
//! re-checks the cache, calls the auth endpoint, and stores the new token.
//! Losers wait (bounded) and then read what the winner stored. The auth
//! endpoint sees at most one call per expiry window across the cluster.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use batchrelay_core::Clock;
use batchrelay_resilience::{Classify, PolicyError, Retry, RetryConfig};

use crate::kv::{CacheError, DistributedLock, SharedCache};

pub const TOKEN_KEY: &str = "api:auth:token";
pub const METADATA_KEY: &str = "api:auth:metadata";
pub const REFRESH_LOCK_KEY: &str = "api:auth:refresh:lock";

/// Used when the auth endpoint omits `expiresAt`.
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AuthError {
    #[error("auth endpoint rejected credentials ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("auth endpoint unreachable: {0}")]
    Transport(String),

    #[error("invalid auth response: {0}")]
    InvalidResponse(String),

    #[error("timed out waiting for token refresh by another instance")]
    LockTimeout,

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl Classify for AuthError {
    fn is_retryable(&self) -> bool {
        matches!(self, AuthError::Transport(_))
    }

    fn counts_as_failure(&self) -> bool {
        false
    }
}

/// A freshly issued token.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Remote side that mints tokens.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> Result<IssuedToken, AuthError>;
}

/// Supplies a currently valid bearer token.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String, AuthError>;

    /// Report that the downstream refused `token`, so it is not served again.
    async fn reject(&self, _token: &str) -> Result<(), AuthError> {
        Ok(())
    }
}

#[async_trait]
impl<P: TokenProvider + ?Sized> TokenProvider for Arc<P> {
    async fn token(&self) -> Result<String, AuthError> {
        (**self).token().await
    }

    async fn reject(&self, token: &str) -> Result<(), AuthError> {
        (**self).reject(token).await
    }
}

/// Metadata stored next to the token, in epoch millis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedCredential {
    #[serde(skip)]
    pub token: String,
    pub expires_at: i64,
    pub refreshed_at: i64,
}

impl CachedCredential {
    /// Usable when more than `buffer` remains before expiry.
    pub fn is_fresh(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        let buffer_ms = buffer.as_millis() as i64;
        self.expires_at - now.timestamp_millis() > buffer_ms
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CredentialSettings {
    pub safety_buffer: Duration,
    pub min_lifetime: Duration,
    pub lock_wait: Duration,
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            safety_buffer: Duration::from_secs(3 * 60),
            min_lifetime: Duration::from_secs(2 * 60),
            lock_wait: Duration::from_secs(10),
        }
    }
}

pub struct CredentialCache<C, T> {
    cache: C,
    lock: DistributedLock<C>,
    source: T,
    settings: CredentialSettings,
    clock: Arc<dyn Clock>,
}

impl<C, T> CredentialCache<C, T>
where
    C: SharedCache + Clone,
    T: TokenSource,
{
    pub fn new(
        cache: C,
        lock: DistributedLock<C>,
        source: T,
        settings: CredentialSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache,
            lock,
            source,
            settings,
            clock,
        }
    }

    /// Return a valid token, refreshing it cluster-wide at most once.
    pub async fn get_token(&self) -> Result<String, AuthError> {
        if let Some(token) = self.fresh_cached().await {
            debug!("using cached auth token");
            return Ok(token);
        }

        let lock_token = self
            .lock
            .acquire_with_timeout(REFRESH_LOCK_KEY, self.settings.lock_wait)
            .await?;

        let Some(lock_token) = lock_token else {
            // Whoever held the lock has most likely refreshed by now.
            return self.fresh_cached().await.ok_or(AuthError::LockTimeout);
        };

        let result = self.refresh_holding_lock().await;
        if let Err(e) = self.lock.release(REFRESH_LOCK_KEY, &lock_token).await {
            warn!(error = %e, "failed to release token refresh lock");
        }
        result
    }

    /// Drop the cached token if it is still `rejected`, so the next call
    /// refreshes. A token another instance already replaced is left alone.
    /// Returns true when the cached entry was removed.
    pub async fn invalidate(&self, rejected: &str) -> Result<bool, AuthError> {
        if !self.cache.compare_and_delete(TOKEN_KEY, rejected).await? {
            return Ok(false);
        }
        self.cache.delete(METADATA_KEY).await?;
        info!("rejected auth token evicted from cache");
        Ok(true)
    }

    async fn refresh_holding_lock(&self) -> Result<String, AuthError> {
        if let Some(token) = self.fresh_cached().await {
            debug!("token refreshed by another instance while waiting");
            return Ok(token);
        }

        let issued = self.source.fetch().await?;
        let now = self.clock.now();
        let remaining = (issued.expires_at - now).to_std().unwrap_or(Duration::ZERO);
        let ttl = remaining
            .saturating_sub(self.settings.safety_buffer)
            .max(self.settings.min_lifetime);

        let metadata = CachedCredential {
            token: issued.token.clone(),
            expires_at: issued.expires_at.timestamp_millis(),
            refreshed_at: now.timestamp_millis(),
        };
        if let Err(e) = self.store(&metadata, ttl).await {
            // The token is still good for this caller; others will refresh again.
            warn!(error = %e, "failed to cache refreshed auth token");
        }
        info!(
            expires_at = %issued.expires_at,
            cache_ttl_secs = ttl.as_secs(),
            "auth token refreshed"
        );
        Ok(issued.token)
    }

    async fn store(&self, credential: &CachedCredential, ttl: Duration) -> Result<(), AuthError> {
        let metadata = serde_json::to_string(credential)
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
        self.cache.set_with_ttl(TOKEN_KEY, &credential.token, ttl).await?;
        self.cache.set_with_ttl(METADATA_KEY, &metadata, ttl).await?;
        Ok(())
    }

    /// Cache read errors count as a miss.
    async fn fresh_cached(&self) -> Option<String> {
        let credential = match self.read_cached().await {
            Ok(credential) => credential?,
            Err(e) => {
                warn!(error = %e, "auth token cache read failed; treating as miss");
                return None;
            }
        };
        credential
            .is_fresh(self.clock.now(), self.settings.safety_buffer)
            .then_some(credential.token)
    }

    async fn read_cached(&self) -> Result<Option<CachedCredential>, CacheError> {
        let Some(token) = self.cache.get(TOKEN_KEY).await? else {
            return Ok(None);
        };
        let Some(raw) = self.cache.get(METADATA_KEY).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<CachedCredential>(&raw) {
            Ok(mut credential) => {
                credential.token = token;
                Ok(Some(credential))
            }
            Err(e) => {
                warn!(error = %e, "unreadable auth token metadata; ignoring cached token");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl<C, T> TokenProvider for CredentialCache<C, T>
where
    C: SharedCache + Clone,
    T: TokenSource,
{
    async fn token(&self) -> Result<String, AuthError> {
        self.get_token().await
    }

    async fn reject(&self, token: &str) -> Result<(), AuthError> {
        self.invalidate(token).await.map(|_| ())
    }
}

#[derive(Debug, Serialize)]
struct AuthRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthResponse {
    token: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

/// `POST auth_url {username, password}` -> `{token, expiresAt}`.
///
/// Transport failures are retried (exponential, 1s up to 5s); any HTTP error
/// status is final. The whole exchange is bounded by `overall_timeout`.
pub struct HttpTokenSource {
    client: reqwest::Client,
    auth_url: String,
    username: String,
    password: String,
    retry: Retry,
    overall_timeout: Duration,
}

impl std::fmt::Debug for HttpTokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTokenSource")
            .field("auth_url", &self.auth_url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl HttpTokenSource {
    pub fn new(
        client: reqwest::Client,
        auth_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            client,
            auth_url: auth_url.into(),
            username: username.into(),
            password: password.into(),
            retry: Retry::new(
                "auth",
                RetryConfig::exponential(3, Duration::from_secs(1), Duration::from_secs(5)),
            ),
            overall_timeout: Duration::from_secs(15),
        }
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = Retry::new("auth", config);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.overall_timeout = timeout;
        self
    }

    async fn fetch_once(&self) -> Result<IssuedToken, AuthError> {
        let response = self
            .client
            .post(&self.auth_url)
            .json(&AuthRequest {
                username: &self.username,
                password: &self.password,
            })
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let body: AuthResponse = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
        if body.token.is_empty() {
            return Err(AuthError::InvalidResponse("empty token".to_string()));
        }
        let expires_at = body.expires_at.unwrap_or_else(|| {
            Utc::now() + chrono::Duration::from_std(DEFAULT_TOKEN_LIFETIME).unwrap_or_default()
        });
        Ok(IssuedToken {
            token: body.token,
            expires_at,
        })
    }
}

#[async_trait]
impl TokenSource for HttpTokenSource {
    async fn fetch(&self) -> Result<IssuedToken, AuthError> {
        let attempts = self
            .retry
            .call(|| async { self.fetch_once().await.map_err(PolicyError::Inner) });
        match tokio::time::timeout(self.overall_timeout, attempts).await {
            Ok(Ok(token)) => Ok(token),
            Ok(Err(PolicyError::Inner(e))) => Err(e),
            Ok(Err(other)) => Err(AuthError::Transport(other.to_string())),
            Err(_) => Err(AuthError::Transport(format!(
                "auth request exceeded {}s",
                self.overall_timeout.as_secs()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{Json, Router, http::StatusCode, routing::post};
    use batchrelay_core::ManualClock;

    use crate::kv::InMemoryCache;

    struct CountingSource {
        calls: AtomicUsize,
        lifetime: chrono::Duration,
        clock: Arc<ManualClock>,
        delay: Duration,
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn fetch(&self) -> Result<IssuedToken, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            Ok(IssuedToken {
                token: format!("token-{n}"),
                expires_at: self.clock.now() + self.lifetime,
            })
        }
    }

    fn source(clock: Arc<ManualClock>, lifetime_mins: i64) -> CountingSource {
        CountingSource {
            calls: AtomicUsize::new(0),
            lifetime: chrono::Duration::minutes(lifetime_mins),
            clock,
            delay: Duration::from_millis(50),
        }
    }

    fn credential_cache(
        cache: Arc<InMemoryCache>,
        source: CountingSource,
        clock: Arc<ManualClock>,
    ) -> CredentialCache<Arc<InMemoryCache>, CountingSource> {
        let lock = DistributedLock::new(cache.clone(), Duration::from_secs(30), Duration::from_millis(10));
        CredentialCache::new(cache, lock, source, CredentialSettings::default(), clock)
    }

    #[tokio::test(start_paused = true)]
    async fn caches_token_until_buffer() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = Arc::new(InMemoryCache::new());
        let creds = credential_cache(cache.clone(), source(clock.clone(), 10), clock.clone());

        assert_eq!(creds.get_token().await.unwrap(), "token-1");
        assert_eq!(creds.get_token().await.unwrap(), "token-1");
        assert_eq!(creds.source.calls.load(Ordering::SeqCst), 1);
        // 10 minute token, 3 minute buffer.
        assert_eq!(cache.ttl(TOKEN_KEY), Some(Duration::from_secs(7 * 60)));

        clock.advance(Duration::from_secs(7 * 60 + 1));
        assert_eq!(creds.get_token().await.unwrap(), "token-2");
    }

    #[tokio::test(start_paused = true)]
    async fn short_lived_tokens_use_minimum_ttl() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = Arc::new(InMemoryCache::new());
        let creds = credential_cache(cache.clone(), source(clock.clone(), 4), clock.clone());
        creds.get_token().await.unwrap();
        assert_eq!(cache.ttl(TOKEN_KEY), Some(Duration::from_secs(2 * 60)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_expiry_refreshes_once() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = Arc::new(InMemoryCache::new());
        let creds = Arc::new(credential_cache(cache, source(clock.clone(), 10), clock.clone()));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let creds = creds.clone();
            handles.push(tokio::spawn(async move { creds.get_token().await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "token-1");
        }
        assert_eq!(creds.source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_timeout_without_fresh_token_is_an_auth_error() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = Arc::new(InMemoryCache::new());
        let creds = credential_cache(cache.clone(), source(clock.clone(), 10), clock.clone());

        cache
            .set_with_ttl(REFRESH_LOCK_KEY, "someone-else", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(creds.get_token().await, Err(AuthError::LockTimeout));
        assert_eq!(creds.source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_metadata_forces_refresh() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = Arc::new(InMemoryCache::new());
        let creds = credential_cache(cache.clone(), source(clock.clone(), 10), clock.clone());
        cache.set_with_ttl(TOKEN_KEY, "old", Duration::from_secs(600)).await.unwrap();
        cache.set_with_ttl(METADATA_KEY, "{oops", Duration::from_secs(600)).await.unwrap();

        assert_eq!(creds.get_token().await.unwrap(), "token-1");
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_token_is_refreshed_on_next_call() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = Arc::new(InMemoryCache::new());
        let creds = credential_cache(cache.clone(), source(clock.clone(), 10), clock.clone());

        let first = creds.get_token().await.unwrap();
        creds.reject(&first).await.unwrap();
        assert_eq!(creds.get_token().await.unwrap(), "token-2");
        assert_eq!(creds.source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_rejection_keeps_the_replacement_token() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = Arc::new(InMemoryCache::new());
        let creds = credential_cache(cache.clone(), source(clock.clone(), 10), clock.clone());

        creds.get_token().await.unwrap();
        assert!(!creds.invalidate("token-0").await.unwrap());
        assert_eq!(creds.get_token().await.unwrap(), "token-1");
        assert_eq!(creds.source.calls.load(Ordering::SeqCst), 1);
    }

    async fn spawn_auth_server(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/auth", addr)
    }

    #[tokio::test]
    async fn http_source_posts_credentials_and_parses_expiry() {
        let router = Router::new().route(
            "/auth",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["username"], "svc");
                assert_eq!(body["password"], "secret");
                Json(serde_json::json!({"token": "abc", "expiresAt": "2030-01-01T00:00:00Z"}))
            }),
        );
        let url = spawn_auth_server(router).await;
        let source = HttpTokenSource::new(reqwest::Client::new(), url, "svc", "secret");
        let issued = source.fetch().await.unwrap();
        assert_eq!(issued.token, "abc");
        assert_eq!(issued.expires_at.to_rfc3339(), "2030-01-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn http_source_does_not_retry_rejections() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/auth",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::UNAUTHORIZED, "bad credentials")
                }
            }),
        );
        let url = spawn_auth_server(router).await;
        let source = HttpTokenSource::new(reqwest::Client::new(), url, "svc", "wrong");
        let err = source.fetch().await.unwrap_err();
        assert_eq!(
            err,
            AuthError::Rejected {
                status: 401,
                body: "bad credentials".to_string()
            }
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn http_source_defaults_missing_expiry() {
        let router = Router::new().route("/auth", post(|| async { Json(serde_json::json!({"token": "abc"})) }));
        let url = spawn_auth_server(router).await;
        let source = HttpTokenSource::new(reqwest::Client::new(), url, "svc", "secret");
        let issued = source.fetch().await.unwrap();
        let lifetime = issued.expires_at - Utc::now();
        assert!(lifetime > chrono::Duration::minutes(9));
        assert!(lifetime <= chrono::Duration::minutes(10));
    }
}
