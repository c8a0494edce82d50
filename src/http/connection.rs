//! Connection Pool Management
//!
//! This module provides the shared HTTP client, the optional global download
//! rate limit, and the retry policy with exponential backoff.

use crate::config::{BackoffConfig, HttpConfig};
use crate::error::{EngineError, NetworkErrorKind, Result};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::Client;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Granularity of rate limiter permits
const LIMITER_CHUNK: u64 = 16 * 1024;

/// HTTP client with rate limiting
pub struct ConnectionPool {
    /// HTTP client (reqwest handles its own connection pool)
    client: Client,
    /// Global rate limiter for download speed
    download_limiter: Option<DefaultDirectRateLimiter>,
    /// Total bytes downloaded through this pool
    total_downloaded: AtomicU64,
}

impl ConnectionPool {
    /// Create a new connection pool
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.connect_timeout))
            .read_timeout(Duration::from_secs(config.read_timeout))
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(Duration::from_secs(90));

        if let Some(ref proxy_url) = config.proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| {
                EngineError::invalid_input("http.proxy_url", format!("Invalid proxy URL: {}", e))
            })?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| EngineError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            download_limiter: None,
            total_downloaded: AtomicU64::new(0),
        })
    }

    /// Create a connection pool with a global download limit (bytes/sec)
    pub fn with_limit(config: &HttpConfig, download_limit: Option<u64>) -> Result<Self> {
        let mut pool = Self::new(config)?;
        pool.download_limiter = download_limit.and_then(|limit| {
            let clamped = limit.min(u32::MAX as u64) as u32;
            NonZeroU32::new(clamped).map(|n| RateLimiter::direct(Quota::per_second(n)))
        });
        Ok(pool)
    }

    /// Get the underlying HTTP client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Wait for rate limiter permission to download bytes
    pub async fn acquire_download(&self, bytes: u64) {
        let Some(ref limiter) = self.download_limiter else {
            return;
        };
        // Permits are taken in chunks so one large read cannot exceed the burst size
        let mut remaining = bytes;
        while remaining > 0 {
            let take = remaining.min(LIMITER_CHUNK);
            if let Some(n) = NonZeroU32::new(take as u32) {
                if limiter.until_n_ready(n).await.is_err() {
                    tracing::debug!("Rate limiter burst smaller than {} bytes", take);
                    return;
                }
            }
            remaining -= take;
        }
    }

    /// Record downloaded bytes
    pub fn record_download(&self, bytes: u64) {
        self.total_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Get total downloaded bytes
    pub fn total_downloaded(&self) -> u64 {
        self.total_downloaded.load(Ordering::Relaxed)
    }
}

/// Retry policy with exponential backoff and jitter
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds
    pub base_ms: u64,
    /// Growth factor per attempt
    pub factor: f64,
    /// Maximum delay in milliseconds
    pub cap_ms: u64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, &BackoffConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: &BackoffConfig) -> Self {
        Self {
            max_retries,
            base_ms: backoff.base_ms,
            factor: backoff.factor,
            cap_ms: backoff.cap_ms,
            jitter: backoff.jitter,
        }
    }

    /// Total attempts including the first one
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `attempt` (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.min(32) as i32);
        let capped = (self.base_ms as f64 * exp).min(self.cap_ms as f64);

        // Add jitter: ±jitter randomness
        let jitter = (rand::random::<f64>() - 0.5) * 2.0 * self.jitter;
        let with_jitter = (capped * (1.0 + jitter)).max(0.0);

        Duration::from_millis(with_jitter as u64)
    }

    /// Check if we should retry based on error type
    pub fn should_retry(&self, attempt: u32, error: &EngineError) -> bool {
        attempt < self.max_retries && error.is_retryable()
    }
}

/// Execute a request with retry logic
pub async fn with_retry<F, T, Fut>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if policy.should_retry(attempt, &e) => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::debug!(
                    "Request failed (attempt {}), retrying in {:?}: {}",
                    attempt + 1,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Map a non-success status to a network error
pub fn status_error(status: reqwest::StatusCode, context: &str) -> EngineError {
    EngineError::network(
        NetworkErrorKind::HttpStatus(status.as_u16()),
        format!("{} returned HTTP {}", context, status),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn policy(jitter: f64) -> RetryPolicy {
        RetryPolicy::new(
            3,
            &BackoffConfig {
                base_ms: 500,
                factor: 2.0,
                cap_ms: 30_000,
                jitter,
            },
        )
    }

    #[test]
    fn test_retry_delay_exponential() {
        let policy = policy(0.0);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(30_000));
    }

    #[test]
    fn test_retry_delay_jitter_bounds() {
        let policy = policy(0.25);
        for _ in 0..100 {
            let delay = policy.delay_for_attempt(1).as_millis();
            assert!((750..=1250).contains(&delay), "delay {} out of bounds", delay);
        }
    }

    #[test]
    fn test_should_retry() {
        let policy = policy(0.0);
        let transient = EngineError::network(NetworkErrorKind::Timeout, "t");
        let permanent = EngineError::network(NetworkErrorKind::HttpStatus(404), "nf");
        assert!(policy.should_retry(0, &transient));
        assert!(policy.should_retry(2, &transient));
        assert!(!policy.should_retry(3, &transient));
        assert!(!policy.should_retry(0, &permanent));
        assert_eq!(policy.max_attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&policy(0.0), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::network(NetworkErrorKind::ConnectionReset, "reset"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_recovers() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&policy(0.0), || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(EngineError::network(NetworkErrorKind::Timeout, "slow"))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
    }
}
