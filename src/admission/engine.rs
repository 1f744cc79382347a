//! The admission engine.
//!
//! Decides per request, in order:
//! 1. exact path allowlist,
//! 2. trusted bearer token,
//! 3. fixed-window rate limit in the counter store.
//!
//! The first rule that applies wins. A counter store failure never escapes:
//! the configured [`FailurePolicy`] turns it into a decision.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, instrument, trace};

use super::decision::{Admission, Decision, DenyReason};
use super::limiter::FixedWindowLimiter;
use super::request::RequestDescriptor;
use super::tokens::{bearer_token, TrustedTokens};
use crate::config::{AdmissionConfig, ClientIpConfig, FailurePolicy, RateLimitRule, StoreConfig};
use crate::error::{Result, StoreError};
use crate::store::CounterStore;

/// Admission engine, shared across all request tasks.
///
/// Immutable after construction; all mutable state lives in the counter
/// store.
pub struct AdmissionEngine {
    allowed_paths: HashSet<String>,
    trusted_tokens: TrustedTokens,
    failure_policy: FailurePolicy,
    client_ip: ClientIpConfig,
    limiter: FixedWindowLimiter,
}

impl AdmissionEngine {
    /// Build an engine from validated admission rules and a counter store.
    pub fn new(
        config: AdmissionConfig,
        store_config: &StoreConfig,
        store: Arc<dyn CounterStore>,
    ) -> Result<Self> {
        config.validate()?;

        debug!(
            limit = config.rate_limit.limit,
            window_secs = config.rate_limit.window_secs,
            trusted_tokens = config.trusted_tokens.len(),
            allowed_paths = config.allowed_paths.len(),
            failure_policy = ?config.failure_policy,
            expiry_mode = ?store_config.expiry_mode,
            "Admission engine configured"
        );

        Ok(Self {
            limiter: FixedWindowLimiter::new(store, config.rate_limit, store_config),
            allowed_paths: config.allowed_paths,
            trusted_tokens: config.trusted_tokens,
            failure_policy: config.failure_policy,
            client_ip: config.client_ip,
        })
    }

    /// Headers the client identifier is derived from.
    pub fn client_ip(&self) -> &ClientIpConfig {
        &self.client_ip
    }

    pub fn rate_limit(&self) -> RateLimitRule {
        self.limiter.rule()
    }

    /// Decide whether `request` is admitted.
    #[instrument(
        level = "debug",
        skip_all,
        fields(path = %request.path, client = %request.client_id)
    )]
    pub async fn decide(&self, request: &RequestDescriptor) -> Decision {
        if self.allowed_paths.contains(&request.path) {
            trace!("Path is allowlisted");
            return Decision::Allow(Admission::AllowedPath);
        }

        let token = bearer_token(request.authorization.as_deref());
        if self.trusted_tokens.contains(token) {
            trace!("Trusted token presented");
            return Decision::Allow(Admission::TrustedToken);
        }

        match self.limiter.hit(&request.client_id).await {
            Ok(window) if window.within_limit() => Decision::Allow(Admission::WithinLimit {
                count: window.count,
                limit: window.limit,
            }),
            Ok(window) => {
                debug!(count = window.count, limit = window.limit, "Rate limit exceeded");
                Decision::Deny(DenyReason::RateLimitExceeded {
                    count: window.count,
                    limit: window.limit,
                })
            }
            Err(e) => self.on_store_failure(e),
        }
    }

    fn on_store_failure(&self, cause: StoreError) -> Decision {
        match self.failure_policy {
            FailurePolicy::Open => Decision::AllowOnError(cause),
            FailurePolicy::Closed => Decision::Deny(DenyReason::StoreUnavailable(cause)),
        }
    }
}

impl std::fmt::Debug for AdmissionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionEngine")
            .field("allowed_paths", &self.allowed_paths)
            .field("trusted_tokens", &self.trusted_tokens)
            .field("failure_policy", &self.failure_policy)
            .field("rate_limit", &self.limiter.rule())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::ClientId;
    use crate::error::BouncerError;
    use crate::store::testing::{CountingStore, FailOn, FailingStore, StallingStore};
    use crate::store::MemoryCounterStore;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    const TRUSTED: &str = "trusted-service-token-0123456789abcdef";

    fn admission(limit: u64, window_secs: u64) -> AdmissionConfig {
        AdmissionConfig {
            rate_limit: RateLimitRule::new(limit, window_secs),
            trusted_tokens: TrustedTokens::new([TRUSTED]),
            allowed_paths: ["/healthz".to_string()].into_iter().collect(),
            ..AdmissionConfig::default()
        }
    }

    fn store_config() -> StoreConfig {
        StoreConfig {
            url: "memory://".to_string(),
            ..StoreConfig::default()
        }
    }

    fn engine(config: AdmissionConfig, store: Arc<dyn CounterStore>) -> AdmissionEngine {
        AdmissionEngine::new(config, &store_config(), store).unwrap()
    }

    fn request(path: &str, authorization: Option<&str>, client: &str) -> RequestDescriptor {
        RequestDescriptor::new(path, authorization.map(str::to_string), ClientId::new(client))
    }

    #[test]
    fn test_invalid_config_rejected() {
        let store: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());

        let result = AdmissionEngine::new(admission(0, 20), &store_config(), store.clone());
        assert!(matches!(result, Err(BouncerError::Config(_))));

        let result = AdmissionEngine::new(admission(3, 0), &store_config(), store);
        assert!(matches!(result, Err(BouncerError::Config(_))));
    }

    #[tokio::test]
    async fn test_allowed_path_skips_store() {
        let store = Arc::new(CountingStore::new());
        let engine = engine(admission(1, 20), store.clone());

        for _ in 0..5 {
            let decision = engine.decide(&request("/healthz", None, "9.9.9.9")).await;
            assert_eq!(decision, Decision::Allow(Admission::AllowedPath));
        }
        assert_eq!(store.calls(), 0);
    }

    #[tokio::test]
    async fn test_allowed_path_is_exact_match() {
        let store = Arc::new(CountingStore::new());
        let engine = engine(admission(10, 20), store.clone());

        for path in ["/healthz/", "/healthz/deep", "/health", "/HEALTHZ"] {
            let decision = engine.decide(&request(path, None, "9.9.9.9")).await;
            assert!(matches!(decision, Decision::Allow(Admission::WithinLimit { .. })));
        }
        assert_eq!(store.calls(), 4);
    }

    #[tokio::test]
    async fn test_trusted_token_skips_store_even_at_limit() {
        let store = Arc::new(CountingStore::new());
        store.inner().insert_persistent("ratelimit:9.9.9.9", 1000);
        let engine = engine(admission(3, 20), store.clone());
        let auth = format!("Bearer {}", TRUSTED);

        let decision = engine.decide(&request("/api/data", Some(&auth), "9.9.9.9")).await;

        assert_eq!(decision, Decision::Allow(Admission::TrustedToken));
        assert_eq!(store.calls(), 0);
    }

    #[tokio::test]
    async fn test_token_without_bearer_prefix_is_not_trusted() {
        let store = Arc::new(CountingStore::new());
        let engine = engine(admission(3, 20), store.clone());

        let decision = engine.decide(&request("/api/data", Some(TRUSTED), "9.9.9.9")).await;

        assert!(matches!(decision, Decision::Allow(Admission::WithinLimit { count: 1, .. })));
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test]
    async fn test_fixed_window_scenario() {
        let engine = engine(admission(3, 20), Arc::new(MemoryCounterStore::new()));
        let req = request("/api/data", None, "9.9.9.9");

        for count in 1..=3 {
            assert_eq!(
                engine.decide(&req).await,
                Decision::Allow(Admission::WithinLimit { count, limit: 3 })
            );
        }

        let decision = engine.decide(&req).await;
        assert_eq!(
            decision,
            Decision::Deny(DenyReason::RateLimitExceeded { count: 4, limit: 3 })
        );
        match decision {
            Decision::Deny(reason) => assert_eq!(reason.message(), "rate limit exceeded"),
            other => panic!("expected deny, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wrong_token_at_limit_is_denied() {
        let engine = engine(admission(3, 20), Arc::new(MemoryCounterStore::new()));
        let anonymous = request("/api/data", None, "9.9.9.9");
        for _ in 0..3 {
            assert!(engine.decide(&anonymous).await.is_allowed());
        }

        let decision = engine
            .decide(&request("/api/data", Some("Bearer wrong-token"), "9.9.9.9"))
            .await;

        assert!(matches!(decision, Decision::Deny(DenyReason::RateLimitExceeded { .. })));
    }

    #[tokio::test]
    async fn test_clients_have_separate_windows() {
        let engine = engine(admission(1, 20), Arc::new(MemoryCounterStore::new()));

        assert!(engine.decide(&request("/a", None, "1.1.1.1")).await.is_allowed());
        assert!(engine.decide(&request("/a", None, "2.2.2.2")).await.is_allowed());
        assert!(!engine.decide(&request("/a", None, "1.1.1.1")).await.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_reset_after_expiry() {
        let engine = engine(admission(3, 20), Arc::new(MemoryCounterStore::new()));
        let req = request("/api/data", None, "9.9.9.9");

        for _ in 0..3 {
            assert!(engine.decide(&req).await.is_allowed());
        }
        assert!(!engine.decide(&req).await.is_allowed());

        tokio::time::advance(Duration::from_secs(19)).await;
        assert!(!engine.decide(&req).await.is_allowed());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(
            engine.decide(&req).await,
            Decision::Allow(Admission::WithinLimit { count: 1, limit: 3 })
        );
    }

    #[tokio::test]
    async fn test_increment_failure_fails_open() {
        let engine = engine(admission(3, 20), Arc::new(FailingStore::new(FailOn::Increment)));

        let decision = engine.decide(&request("/api/data", None, "9.9.9.9")).await;

        assert!(decision.is_allowed());
        assert!(matches!(decision, Decision::AllowOnError(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_expire_failure_fails_open() {
        let config = StoreConfig {
            expiry_mode: crate::config::ExpiryMode::TwoStep,
            ..store_config()
        };
        let engine = AdmissionEngine::new(
            admission(3, 20),
            &config,
            Arc::new(FailingStore::new(FailOn::Expire)),
        )
        .unwrap();

        let decision = engine.decide(&request("/api/data", None, "9.9.9.9")).await;

        assert!(matches!(decision, Decision::AllowOnError(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_timeout_fails_open() {
        let engine = engine(admission(3, 20), Arc::new(StallingStore));

        let decision = engine.decide(&request("/api/data", None, "9.9.9.9")).await;

        assert!(matches!(decision, Decision::AllowOnError(StoreError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_closed_policy_denies_on_store_failure() {
        let config = AdmissionConfig {
            failure_policy: FailurePolicy::Closed,
            ..admission(3, 20)
        };
        let engine = engine(config, Arc::new(FailingStore::new(FailOn::Increment)));

        let decision = engine.decide(&request("/api/data", None, "9.9.9.9")).await;

        assert!(matches!(decision, Decision::Deny(DenyReason::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_bypass_rules_ignore_store_failure() {
        let engine = engine(admission(3, 20), Arc::new(FailingStore::new(FailOn::Increment)));
        let auth = format!("Bearer {}", TRUSTED);

        assert_eq!(
            engine.decide(&request("/healthz", None, "9.9.9.9")).await,
            Decision::Allow(Admission::AllowedPath)
        );
        assert_eq!(
            engine.decide(&request("/api/data", Some(&auth), "9.9.9.9")).await,
            Decision::Allow(Admission::TrustedToken)
        );
    }

    #[tokio::test]
    async fn test_concurrent_requests_admit_exactly_limit() {
        let engine = Arc::new(engine(admission(10, 20), Arc::new(MemoryCounterStore::new())));

        let tasks: Vec<_> = (0..25)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine.decide(&request("/api/data", None, "9.9.9.9")).await
                })
            })
            .collect();

        let mut allowed = 0;
        for task in futures::future::join_all(tasks).await {
            let decision = assert_ok!(task);
            if decision.is_allowed() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[tokio::test]
    async fn test_empty_token_never_bypasses() {
        let engine = engine(admission(1, 20), Arc::new(MemoryCounterStore::new()));

        engine.decide(&request("/a", None, "9.9.9.9")).await;
        let decision = engine.decide(&request("/a", Some("Bearer "), "9.9.9.9")).await;

        assert!(!decision.is_allowed());
    }

    #[test]
    fn test_config_with_empty_token_rejected() {
        let config = AdmissionConfig {
            trusted_tokens: TrustedTokens::new([""]),
            ..admission(3, 20)
        };
        let store: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());
        assert_err!(AdmissionEngine::new(config, &store_config(), store));
    }
}
