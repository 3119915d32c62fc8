//! Fixed-window rate limiter over the key/value seam.
//!
//! One counter per principal, keyed `rate_limit:{principal}`. The backend
//! failing must never take the service down with it, so limit checks fail
//! open with a warning.

use crate::kv::KeyValueStore;
use crate::{CacheError, CacheResult};
use std::sync::Arc;
use std::time::Duration;

/// Fixed-window parameters.
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub window_ms: u64,
    pub max_requests: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_requests: 300,
        }
    }
}

/// Outcome of one limit check.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    /// Requests left in the current window.
    pub remaining: u64,
    /// Seconds until the window resets; meaningful when not allowed.
    pub retry_after_secs: u64,
}

/// Per-principal fixed-window rate limiter.
pub struct RateLimiter {
    kv: Arc<dyn KeyValueStore>,
    config: RateLimiterConfig,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KeyValueStore>, config: RateLimiterConfig) -> Self {
        Self { kv, config }
    }

    pub fn config(&self) -> RateLimiterConfig {
        self.config
    }

    /// Count one request against the principal's window.
    pub async fn check(&self, principal: &str) -> RateDecision {
        let key = format!("rate_limit:{principal}");
        let window = Duration::from_millis(self.config.window_ms);
        match self.kv.incr(&key, window).await {
            Ok(counter) => {
                let remaining = self.config.max_requests.saturating_sub(counter.count);
                let retry_after_secs =
                    (counter.expires_in.as_millis() as u64).div_ceil(1_000).max(1);
                RateDecision {
                    allowed: counter.count <= self.config.max_requests,
                    remaining,
                    retry_after_secs,
                }
            }
            Err(e) => {
                // Fail open: the limiter backend being down must not block
                // triage.
                tracing::warn!(principal = %principal, error = %e, "rate limiter backend error, allowing request");
                RateDecision {
                    allowed: true,
                    remaining: self.config.max_requests,
                    retry_after_secs: 0,
                }
            }
        }
    }

    /// Like [`check`](Self::check), but over-limit requests fail fast.
    pub async fn enforce(&self, principal: &str) -> CacheResult<RateDecision> {
        let decision = self.check(principal).await;
        if !decision.allowed {
            return Err(CacheError::RateLimited {
                retry_after_secs: decision.retry_after_secs,
            });
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use async_trait::async_trait;

    fn make_limiter(max: u64) -> RateLimiter {
        RateLimiter::new(
            Arc::new(MemoryKv::new()),
            RateLimiterConfig {
                window_ms: 60_000,
                max_requests: max,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn nth_passes_nplus1_is_limited() {
        let limiter = make_limiter(5);
        for i in 0..5 {
            let decision = limiter.check("client-1").await;
            assert!(decision.allowed, "request {i} should pass");
        }
        let decision = limiter.check("client-1").await;
        assert!(!decision.allowed);
        assert!(decision.retry_after_secs <= 60);
        assert!(decision.retry_after_secs >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn window_rollover_admits_again() {
        let limiter = make_limiter(2);
        assert!(limiter.check("c").await.allowed);
        assert!(limiter.check("c").await.allowed);
        assert!(!limiter.check("c").await.allowed);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.check("c").await.allowed);
    }

    #[tokio::test]
    async fn principals_are_isolated() {
        let limiter = make_limiter(1);
        assert!(limiter.check("a").await.allowed);
        assert!(limiter.check("b").await.allowed);
        assert!(!limiter.check("a").await.allowed);
    }

    #[tokio::test]
    async fn enforce_surfaces_retry_after() {
        let limiter = make_limiter(1);
        limiter.enforce("c").await.unwrap();
        match limiter.enforce("c").await {
            Err(CacheError::RateLimited { retry_after_secs }) => {
                assert!(retry_after_secs <= 60);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    struct BrokenKv;

    #[async_trait]
    impl KeyValueStore for BrokenKv {
        async fn get(&self, _key: &str) -> CacheResult<Option<String>> {
            Err(CacheError::Backend("down".to_string()))
        }
        async fn put(&self, _key: &str, _value: String, _ttl: Duration) -> CacheResult<()> {
            Err(CacheError::Backend("down".to_string()))
        }
        async fn delete(&self, _key: &str) -> CacheResult<()> {
            Err(CacheError::Backend("down".to_string()))
        }
        async fn incr(&self, _key: &str, _ttl: Duration) -> CacheResult<crate::kv::Counter> {
            Err(CacheError::Backend("down".to_string()))
        }
    }

    #[tokio::test]
    async fn backend_errors_fail_open() {
        let limiter = RateLimiter::new(Arc::new(BrokenKv), RateLimiterConfig::default());
        assert!(limiter.check("c").await.allowed);
        assert!(limiter.enforce("c").await.is_ok());
    }
}
