//! Distributed fixed-window rate limiter.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::request::ClientId;
use crate::config::{ExpiryMode, RateLimitRule, StoreConfig};
use crate::error::StoreError;
use crate::store::{CounterStore, KeyTtl};

/// Counter value observed for one hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Requests seen in the current window, this one included
    pub count: u64,
    /// Configured budget
    pub limit: u64,
}

impl WindowCount {
    pub fn within_limit(&self) -> bool {
        self.count <= self.limit
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.count)
    }
}

/// Fixed-window limiter keyed by client identifier.
///
/// Holds no counters itself; each hit is one round-trip (two in two-step
/// mode on the first hit of a window) to the counter store, bounded by the
/// configured timeout.
pub struct FixedWindowLimiter {
    store: Arc<dyn CounterStore>,
    rule: RateLimitRule,
    key_prefix: String,
    expiry_mode: ExpiryMode,
    timeout: Duration,
}

impl FixedWindowLimiter {
    pub fn new(store: Arc<dyn CounterStore>, rule: RateLimitRule, store_config: &StoreConfig) -> Self {
        Self {
            store,
            rule,
            key_prefix: store_config.key_prefix.clone(),
            expiry_mode: store_config.expiry_mode,
            timeout: store_config.timeout(),
        }
    }

    pub fn rule(&self) -> RateLimitRule {
        self.rule
    }

    /// Record one request for `client` and report the window count.
    pub async fn hit(&self, client: &ClientId) -> Result<WindowCount, StoreError> {
        let key = client.counter_key(&self.key_prefix);
        let window = self.rule.window_secs;

        let count = match self.expiry_mode {
            ExpiryMode::Atomic => {
                self.bounded(self.store.increment_with_expiry(&key, window))
                    .await?
            }
            ExpiryMode::TwoStep => {
                let count = self.bounded(self.store.increment(&key)).await?;
                if count == 1 {
                    self.bounded(self.store.expire(&key, window)).await?;
                }
                count
            }
        };

        let result = WindowCount {
            count,
            limit: self.rule.limit,
        };

        trace!(key = %key, count = count, limit = self.rule.limit, "Counter incremented");

        if !result.within_limit() && self.expiry_mode == ExpiryMode::TwoStep {
            self.repair_expiry(&key).await;
        }

        Ok(result)
    }

    /// Re-arm the expiry of a counter that has none.
    ///
    /// An increment whose follow-up `expire` never landed leaves a key that
    /// would otherwise lock the client out forever. Only checked on the deny
    /// path, where such a key is the likely cause. Failures are logged and
    /// otherwise ignored.
    async fn repair_expiry(&self, key: &str) {
        match self.bounded(self.store.ttl(key)).await {
            Ok(KeyTtl::Persistent) => {
                warn!(key = %key, "Counter has no expiry, re-arming window");
                if let Err(e) = self.bounded(self.store.expire(key, self.rule.window_secs)).await {
                    warn!(key = %key, error = %e, "Failed to re-arm counter expiry");
                }
            }
            Ok(_) => {}
            Err(e) => {
                debug!(key = %key, error = %e, "Could not inspect counter expiry");
            }
        }
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::{CountingStore, FailOn, FailingStore, StallingStore};
    use crate::store::MemoryCounterStore;

    fn store_config(mode: ExpiryMode) -> StoreConfig {
        StoreConfig {
            url: "memory://".to_string(),
            expiry_mode: mode,
            ..StoreConfig::default()
        }
    }

    fn limiter(store: Arc<dyn CounterStore>, limit: u64, mode: ExpiryMode) -> FixedWindowLimiter {
        FixedWindowLimiter::new(store, RateLimitRule::new(limit, 20), &store_config(mode))
    }

    #[tokio::test]
    async fn test_counts_up_to_and_past_limit() {
        for mode in [ExpiryMode::Atomic, ExpiryMode::TwoStep] {
            let limiter = limiter(Arc::new(MemoryCounterStore::new()), 3, mode);
            let client = ClientId::new("9.9.9.9");

            for expected in 1..=3 {
                let result = limiter.hit(&client).await.unwrap();
                assert_eq!(result.count, expected);
                assert!(result.within_limit());
            }

            let result = limiter.hit(&client).await.unwrap();
            assert_eq!(result.count, 4);
            assert!(!result.within_limit());
            assert_eq!(result.remaining(), 0);
        }
    }

    #[tokio::test]
    async fn test_uses_key_prefix() {
        let store = Arc::new(MemoryCounterStore::new());
        let limiter = limiter(store.clone(), 3, ExpiryMode::Atomic);

        limiter.hit(&ClientId::new("1.2.3.4")).await.unwrap();

        assert_eq!(store.get("ratelimit:1.2.3.4"), Some(1));
    }

    #[tokio::test]
    async fn test_two_step_arms_expiry_on_first_hit() {
        let store = Arc::new(MemoryCounterStore::new());
        let limiter = limiter(store.clone(), 3, ExpiryMode::TwoStep);

        limiter.hit(&ClientId::new("1.2.3.4")).await.unwrap();

        assert_eq!(store.ttl("ratelimit:1.2.3.4").await.unwrap(), KeyTtl::Expires(20));
    }

    #[tokio::test]
    async fn test_two_step_makes_one_call_after_first_hit() {
        let store = Arc::new(CountingStore::new());
        let limiter = limiter(store.clone(), 10, ExpiryMode::TwoStep);
        let client = ClientId::new("1.2.3.4");

        limiter.hit(&client).await.unwrap();
        assert_eq!(store.calls(), 2);

        limiter.hit(&client).await.unwrap();
        assert_eq!(store.calls(), 3);
    }

    #[tokio::test]
    async fn test_two_step_repairs_lockout_on_deny() {
        let store = Arc::new(MemoryCounterStore::new());
        store.insert_persistent("ratelimit:1.2.3.4", 50);
        let limiter = limiter(store.clone(), 3, ExpiryMode::TwoStep);

        let result = limiter.hit(&ClientId::new("1.2.3.4")).await.unwrap();

        assert!(!result.within_limit());
        assert_eq!(store.ttl("ratelimit:1.2.3.4").await.unwrap(), KeyTtl::Expires(20));
    }

    #[tokio::test]
    async fn test_increment_failure_is_reported() {
        let limiter = limiter(Arc::new(FailingStore::new(FailOn::Increment)), 3, ExpiryMode::TwoStep);
        let result = limiter.hit(&ClientId::new("1.2.3.4")).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_expire_failure_is_reported() {
        let limiter = limiter(Arc::new(FailingStore::new(FailOn::Expire)), 3, ExpiryMode::TwoStep);
        let result = limiter.hit(&ClientId::new("1.2.3.4")).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_store_times_out() {
        let limiter = limiter(Arc::new(StallingStore), 3, ExpiryMode::Atomic);
        let result = limiter.hit(&ClientId::new("1.2.3.4")).await;
        assert_eq!(result, Err(StoreError::Timeout(Duration::from_millis(250))));
    }
}
