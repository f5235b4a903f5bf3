//! Admission engine.
//!
//! Combines the local rule registry, the policy book and the shared quota
//! store into a single admission decision per protected call.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{FloodgateError, Result};
use crate::store::{QuotaStore, StoreResult};

use super::decision::{AdmissionDecision, QuotaTelemetry, Reason};
use super::policy::{Algorithm, PolicyBook, RateLimitPolicy};
use super::rules::{RuleRegistry, UserId};
use super::scope::{resolve_client_ip, ClientAddress, ScopeKey};
use super::sliding_window::{self, SlidingWindowMode};
use super::token_bucket::{self, BucketParams};

/// Decides whether protected calls may proceed.
///
/// The engine is shared across tasks; it holds no per-request state.
pub struct AdmissionEngine {
    /// Shared quota state.
    store: Arc<dyn QuotaStore>,
    /// Local enable switch and lists.
    rules: Arc<RuleRegistry>,
    /// Policies bound to operation names.
    policies: RwLock<PolicyBook>,
    clock: Arc<dyn Clock>,
    sliding_window_mode: SlidingWindowMode,
}

impl AdmissionEngine {
    /// Create an engine with an empty policy book and the system clock.
    pub fn new(store: Arc<dyn QuotaStore>, rules: Arc<RuleRegistry>) -> Self {
        Self {
            store,
            rules,
            policies: RwLock::new(PolicyBook::new()),
            clock: Arc::new(SystemClock::new()),
            sliding_window_mode: SlidingWindowMode::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sliding_window_mode(mut self, mode: SlidingWindowMode) -> Self {
        self.sliding_window_mode = mode;
        self
    }

    pub fn with_policies(self, policies: PolicyBook) -> Self {
        self.set_policies(policies);
        self
    }

    /// Replace the policy book.
    pub fn set_policies(&self, policies: PolicyBook) {
        let mut book = self.policies.write();
        *book = policies;
    }

    /// The policy bound to `operation`, if any.
    pub fn policy(&self, operation: &str) -> Option<RateLimitPolicy> {
        self.policies.read().resolve(operation).cloned()
    }

    pub fn policies(&self) -> PolicyBook {
        self.policies.read().clone()
    }

    pub fn rules(&self) -> &Arc<RuleRegistry> {
        &self.rules
    }

    pub fn store(&self) -> &Arc<dyn QuotaStore> {
        &self.store
    }

    pub fn sliding_window_mode(&self) -> SlidingWindowMode {
        self.sliding_window_mode
    }

    /// Check the policy bound to `operation`.
    ///
    /// Fails only when no policy is bound to the operation.
    pub async fn check_operation(
        &self,
        operation: &str,
        user_id: Option<UserId>,
        address: &ClientAddress,
    ) -> Result<AdmissionDecision> {
        let policy = self
            .policy(operation)
            .ok_or_else(|| FloodgateError::UnknownOperation(operation.to_string()))?;
        Ok(self.check(&policy, user_id, address).await)
    }

    /// Check one request against `policy`.
    ///
    /// Store failures are logged and the request is allowed.
    pub async fn check(
        &self,
        policy: &RateLimitPolicy,
        user_id: Option<UserId>,
        address: &ClientAddress,
    ) -> AdmissionDecision {
        if !self.rules.is_enabled() {
            return AdmissionDecision::pass_through(Reason::Disabled);
        }

        let client_ip = resolve_client_ip(address);

        if self.rules.is_blacklisted(&client_ip) {
            debug!(
                client_ip = %client_ip,
                scope = %policy.scope_key_name,
                "Request from blacklisted IP"
            );
            return AdmissionDecision::forbidden();
        }

        if self.rules.is_whitelisted(user_id, Some(&client_ip)) {
            trace!(
                client_ip = %client_ip,
                user_id = ?user_id,
                "Whitelisted request passes through"
            );
            return AdmissionDecision::pass_through(Reason::Whitelisted);
        }

        let key = ScopeKey::build(policy, user_id, &client_ip);
        let now = self.clock.now_millis();

        match self.evaluate(policy, &key, now).await {
            Ok((allowed, quota)) => {
                if allowed {
                    trace!(
                        key = %key,
                        remaining = quota.remaining,
                        "Request admitted"
                    );
                } else {
                    debug!(
                        key = %key,
                        limit = quota.limit,
                        reset_seconds = quota.reset_seconds,
                        "Rate limit exceeded"
                    );
                }
                AdmissionDecision::evaluated(allowed, quota)
            }
            Err(e) => {
                warn!(
                    key = %key,
                    error = %e,
                    "Quota store failed, allowing request"
                );
                AdmissionDecision::pass_through(Reason::StoreUnavailable)
            }
        }
    }

    async fn evaluate(
        &self,
        policy: &RateLimitPolicy,
        key: &ScopeKey,
        now: i64,
    ) -> StoreResult<(bool, QuotaTelemetry)> {
        match policy.algorithm {
            Algorithm::SlidingWindow {
                max_requests,
                window,
            } => {
                let decision = sliding_window::evaluate(
                    self.store.as_ref(),
                    key,
                    max_requests,
                    window,
                    now,
                    self.sliding_window_mode,
                )
                .await?;
                Ok((decision.allowed, decision.quota))
            }
            Algorithm::TokenBucket {
                capacity,
                refill_tokens,
                refill_interval,
            } => {
                let params = BucketParams::new(capacity, refill_tokens, refill_interval);
                let decision =
                    token_bucket::evaluate(self.store.as_ref(), key, params, now).await?;
                Ok((decision.allowed, decision.quota))
            }
        }
    }
}

impl std::fmt::Debug for AdmissionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionEngine")
            .field("policies", &self.policies.read().len())
            .field("sliding_window_mode", &self.sliding_window_mode)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::ratelimit::decision::Outcome;
    use crate::ratelimit::policy::LimitType;
    use crate::store::{
        BucketTake, BucketUpdate, MemoryStore, StoreError, WindowAdmission, WindowOutcome,
    };
    use async_trait::async_trait;
    use std::time::Duration;

    /// Store that fails every call.
    struct UnavailableStore;

    #[async_trait]
    impl QuotaStore for UnavailableStore {
        async fn trim_and_count(&self, _: &str, _: i64, _: i64) -> StoreResult<u64> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn insert_scored(&self, _: &str, _: &str, _: i64) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn set_expiry(&self, _: &str, _: Duration) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn record_within_limit(
            &self,
            _: &str,
            _: &WindowAdmission,
        ) -> StoreResult<WindowOutcome> {
            Err(StoreError::Timeout(Duration::from_millis(250)))
        }

        async fn atomic_update(&self, _: &str, _: &BucketTake) -> StoreResult<BucketUpdate> {
            Err(StoreError::Unavailable("connection reset".to_string()))
        }

        async fn ping(&self) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    fn engine() -> (AdmissionEngine, MockClock) {
        let clock = MockClock::default();
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let engine = AdmissionEngine::new(store, Arc::new(RuleRegistry::new()))
            .with_clock(Arc::new(clock.clone()));
        (engine, clock)
    }

    fn from_ip(ip: &str) -> ClientAddress {
        ClientAddress::new().with_remote_addr(ip)
    }

    fn window_policy(max_requests: u64) -> RateLimitPolicy {
        RateLimitPolicy::sliding_window(
            "create_order",
            LimitType::User,
            max_requests,
            Duration::from_secs(60),
        )
    }

    fn bucket_policy() -> RateLimitPolicy {
        RateLimitPolicy::token_bucket("login", LimitType::Ip, 5, 1, Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_sliding_window_boundary() {
        let (engine, clock) = engine();
        let policy = window_policy(3);
        let address = from_ip("10.0.0.1");

        for _ in 0..3 {
            assert!(engine.check(&policy, Some(1), &address).await.allowed());
        }
        let rejected = engine.check(&policy, Some(1), &address).await;
        assert_eq!(rejected.outcome, Outcome::QuotaExceeded);
        assert_eq!(rejected.quota.unwrap().remaining, 0);

        clock.advance(Duration::from_secs(61));
        assert!(engine.check(&policy, Some(1), &address).await.allowed());
    }

    #[tokio::test]
    async fn test_rejected_calls_do_not_consume_quota() {
        let clock = MockClock::default();
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let engine = AdmissionEngine::new(store.clone(), Arc::new(RuleRegistry::new()))
            .with_clock(Arc::new(clock.clone()));
        let policy = window_policy(3);
        let address = from_ip("10.0.0.1");

        for _ in 0..3 {
            engine.check(&policy, Some(1), &address).await;
        }
        assert!(!engine.check(&policy, Some(1), &address).await.allowed());

        clock.advance(Duration::from_millis(50));
        let now = clock.now_millis();
        let count = store
            .trim_and_count("USER:1:create_order", now - 60_000, now)
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_token_bucket_burst_then_drain() {
        let (engine, clock) = engine();
        let policy = bucket_policy();
        let address = from_ip("192.0.2.1");

        for expected in [4, 3, 2, 1, 0] {
            let decision = engine.check(&policy, None, &address).await;
            assert!(decision.allowed());
            assert_eq!(decision.quota.unwrap().remaining, expected);
        }
        assert!(!engine.check(&policy, None, &address).await.allowed());

        clock.advance(Duration::from_secs(10));
        assert!(engine.check(&policy, None, &address).await.allowed());
        assert!(!engine.check(&policy, None, &address).await.allowed());
    }

    #[tokio::test]
    async fn test_token_bucket_half_interval_waits_add_up() {
        let (engine, clock) = engine();
        let policy = bucket_policy();
        let address = from_ip("192.0.2.1");

        for _ in 0..5 {
            engine.check(&policy, None, &address).await;
        }
        clock.advance(Duration::from_secs(5));
        assert!(!engine.check(&policy, None, &address).await.allowed());
        clock.advance(Duration::from_secs(5));
        assert!(engine.check(&policy, None, &address).await.allowed());
    }

    #[tokio::test]
    async fn test_whitelist_bypasses_zero_limit() {
        let (engine, _clock) = engine();
        let policy = window_policy(0);
        engine.rules().add_user_whitelist(7);
        engine.rules().add_ip_whitelist("10.1.1.1");

        let by_user = engine.check(&policy, Some(7), &from_ip("10.0.0.1")).await;
        assert!(by_user.allowed());
        assert_eq!(by_user.reason, Reason::Whitelisted);
        assert!(by_user.headers().is_empty());

        assert!(engine.check(&policy, None, &from_ip("10.1.1.1")).await.allowed());
        assert!(!engine.check(&policy, Some(8), &from_ip("10.0.0.1")).await.allowed());
    }

    #[tokio::test]
    async fn test_blacklist_wins_over_whitelist() {
        let (engine, _clock) = engine();
        engine.rules().add_ip_whitelist("203.0.113.5");
        engine.rules().add_ip_blacklist("203.0.113.5");
        engine.rules().add_user_whitelist(1);

        let address = ClientAddress::new().with_forwarded_for("203.0.113.5, 10.0.0.1");
        let decision = engine.check(&window_policy(100), Some(1), &address).await;
        assert_eq!(decision.outcome, Outcome::Forbidden);
        assert_eq!(decision.reason, Reason::Blacklisted);
        assert!(decision.quota.is_none());
    }

    #[tokio::test]
    async fn test_disabled_allows_everything() {
        let (engine, _clock) = engine();
        engine.rules().set_enabled(false);
        engine.rules().add_ip_blacklist("10.0.0.1");

        for _ in 0..5 {
            let decision = engine.check(&window_policy(0), None, &from_ip("10.0.0.1")).await;
            assert!(decision.allowed());
            assert_eq!(decision.reason, Reason::Disabled);
        }
    }

    #[tokio::test]
    async fn test_fail_open_for_both_algorithms() {
        for mode in [SlidingWindowMode::Atomic, SlidingWindowMode::Relaxed] {
            let engine = AdmissionEngine::new(
                Arc::new(UnavailableStore),
                Arc::new(RuleRegistry::new()),
            )
            .with_sliding_window_mode(mode);

            let decision = engine.check(&window_policy(0), Some(1), &from_ip("10.0.0.1")).await;
            assert!(decision.allowed());
            assert_eq!(decision.reason, Reason::StoreUnavailable);
        }

        let engine =
            AdmissionEngine::new(Arc::new(UnavailableStore), Arc::new(RuleRegistry::new()));
        let decision = engine.check(&bucket_policy(), None, &from_ip("10.0.0.1")).await;
        assert!(decision.allowed());
        assert!(decision.quota.is_none());
    }

    #[tokio::test]
    async fn test_fail_open_still_honours_blacklist() {
        let engine =
            AdmissionEngine::new(Arc::new(UnavailableStore), Arc::new(RuleRegistry::new()));
        engine.rules().add_ip_blacklist("10.0.0.1");
        let decision = engine.check(&bucket_policy(), None, &from_ip("10.0.0.1")).await;
        assert_eq!(decision.outcome, Outcome::Forbidden);
    }

    #[tokio::test]
    async fn test_user_scopes_are_isolated() {
        let (engine, _clock) = engine();
        let policy = window_policy(2);
        let address = from_ip("10.0.0.1");

        assert!(engine.check(&policy, Some(1), &address).await.allowed());
        assert!(engine.check(&policy, Some(1), &address).await.allowed());
        assert!(!engine.check(&policy, Some(1), &address).await.allowed());

        let other = engine.check(&policy, Some(2), &address).await;
        assert!(other.allowed());
        assert_eq!(other.quota.unwrap().remaining, 1);
    }

    #[tokio::test]
    async fn test_anonymous_users_share_a_scope() {
        let (engine, _clock) = engine();
        let policy = window_policy(1);

        assert!(engine.check(&policy, None, &from_ip("10.0.0.1")).await.allowed());
        assert!(!engine.check(&policy, None, &from_ip("10.0.0.2")).await.allowed());
    }

    #[tokio::test]
    async fn test_check_operation() {
        let (engine, _clock) = engine();
        let mut book = PolicyBook::new();
        book.bind("login", bucket_policy()).unwrap();
        engine.set_policies(book);

        let decision = engine
            .check_operation("login", None, &from_ip("10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(decision.quota.unwrap().limit, 5);

        let err = engine
            .check_operation("logout", None, &from_ip("10.0.0.1"))
            .await
            .unwrap_err();
        assert!(matches!(err, FloodgateError::UnknownOperation(name) if name == "logout"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_never_exceed_limit() {
        let (engine, _clock) = engine();
        let engine = Arc::new(engine);

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    engine
                        .check(&window_policy(10), Some(1), &from_ip("10.0.0.1"))
                        .await
                        .allowed()
                })
            })
            .collect();
        let admitted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|result| matches!(result, Ok(true)))
            .count();
        assert_eq!(admitted, 10);

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    engine
                        .check(&bucket_policy(), None, &from_ip("10.0.0.1"))
                        .await
                        .allowed()
                })
            })
            .collect();
        let admitted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|result| matches!(result, Ok(true)))
            .count();
        assert_eq!(admitted, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exhausted_bucket_holds_under_concurrency() {
        let (engine, clock) = engine();
        let engine = Arc::new(engine);
        let address = from_ip("10.0.0.9");

        for _ in 0..5 {
            assert!(engine.check(&bucket_policy(), None, &address).await.allowed());
        }

        let admitted_by_burst = |engine: Arc<AdmissionEngine>| async move {
            let tasks: Vec<_> = (0..40)
                .map(|_| {
                    let engine = Arc::clone(&engine);
                    tokio::spawn(async move {
                        engine
                            .check(&bucket_policy(), None, &from_ip("10.0.0.9"))
                            .await
                            .allowed()
                    })
                })
                .collect();
            futures::future::join_all(tasks)
                .await
                .into_iter()
                .filter(|result| matches!(result, Ok(true)))
                .count()
        };

        assert_eq!(admitted_by_burst(Arc::clone(&engine)).await, 0);

        // One interval refills exactly one token for the whole burst to share
        clock.advance(Duration::from_secs(10));
        assert_eq!(admitted_by_burst(Arc::clone(&engine)).await, 1);
        assert_eq!(admitted_by_burst(engine).await, 0);
    }
}
