//! Token bucket algorithm.
//!
//! A bucket holds up to `capacity` tokens and gains `refill_tokens` every
//! `refill_interval`. Each admitted request takes one token. Refills are
//! applied in whole intervals and `last_refill` advances by exactly the
//! intervals applied, so partial progress toward the next refill carries
//! over between requests.

use std::time::Duration;

use tracing::trace;

use super::decision::QuotaTelemetry;
use super::scope::ScopeKey;
use crate::clock::duration_millis;
use crate::store::{BucketState, BucketTake, BucketUpdate, QuotaStore, StoreResult};

/// Parameters of a token bucket policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketParams {
    pub capacity: u64,
    pub refill_tokens: u64,
    pub refill_interval_ms: i64,
}

impl BucketParams {
    pub fn new(capacity: u64, refill_tokens: u64, refill_interval: Duration) -> Self {
        Self {
            capacity,
            refill_tokens,
            refill_interval_ms: duration_millis(refill_interval).max(1),
        }
    }

    /// Lifetime of an idle bucket: twice the time to refill from empty,
    /// never less than one interval.
    pub fn ttl(&self) -> Duration {
        let intervals = self.capacity.div_ceil(self.refill_tokens.max(1)).max(1);
        let ttl_ms = (self.refill_interval_ms as u64)
            .saturating_mul(intervals)
            .saturating_mul(2)
            .max(self.refill_interval_ms as u64);
        Duration::from_millis(ttl_ms)
    }
}

/// Apply every whole interval elapsed since the last refill.
pub fn refill(state: BucketState, params: &BucketParams, now: i64) -> BucketState {
    let elapsed = now.saturating_sub(state.last_refill_ms);
    if elapsed < params.refill_interval_ms {
        return state;
    }

    let intervals = elapsed / params.refill_interval_ms;
    let added = (intervals as u64).saturating_mul(params.refill_tokens);
    BucketState {
        tokens: state.tokens.saturating_add(added).min(params.capacity),
        last_refill_ms: state.last_refill_ms + intervals * params.refill_interval_ms,
    }
}

/// Decide one request against the current bucket.
///
/// Admission stores the decremented state; a rejection keeps the stored
/// record untouched.
pub fn decide(current: Option<BucketState>, params: &BucketParams, now: i64) -> BucketUpdate {
    let state = current.unwrap_or(BucketState {
        tokens: params.capacity,
        last_refill_ms: now,
    });
    let state = refill(state, params, now);

    if state.tokens >= 1 {
        BucketUpdate::Store(BucketState {
            tokens: state.tokens - 1,
            last_refill_ms: state.last_refill_ms,
        })
    } else {
        BucketUpdate::Keep(state)
    }
}

/// Seconds until the next whole-interval refill.
pub fn reset_seconds(state: &BucketState, params: &BucketParams, now: i64) -> u64 {
    let into_interval = now
        .saturating_sub(state.last_refill_ms)
        .rem_euclid(params.refill_interval_ms);
    ((params.refill_interval_ms - into_interval) as u64).div_ceil(1000)
}

/// Outcome of one token bucket evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketDecision {
    pub allowed: bool,
    pub quota: QuotaTelemetry,
}

/// Evaluate one request against the bucket stored at `key`.
pub async fn evaluate(
    store: &dyn QuotaStore,
    key: &ScopeKey,
    params: BucketParams,
    now: i64,
) -> StoreResult<BucketDecision> {
    trace!(
        key = %key,
        capacity = params.capacity,
        refill_tokens = params.refill_tokens,
        refill_interval_ms = params.refill_interval_ms,
        "Evaluating token bucket"
    );

    let result = store
        .atomic_update(key.as_str(), &BucketTake::new(params, now))
        .await?;

    let state = result.state();
    let allowed = result.is_stored();
    Ok(BucketDecision {
        allowed,
        quota: QuotaTelemetry {
            limit: params.capacity,
            remaining: if allowed { state.tokens } else { 0 },
            reset_seconds: reset_seconds(&state, &params, now),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, MockClock};
    use crate::ratelimit::policy::{LimitType, RateLimitPolicy};
    use crate::store::MemoryStore;
    use std::sync::Arc;

    const T0: i64 = 1_700_000_000_000;

    fn params(capacity: u64) -> BucketParams {
        BucketParams::new(capacity, 1, Duration::from_secs(10))
    }

    fn setup() -> (MockClock, MemoryStore, ScopeKey) {
        let clock = MockClock::new(T0);
        let store = MemoryStore::new(Arc::new(clock.clone()));
        let policy = RateLimitPolicy::token_bucket(
            "login",
            LimitType::Ip,
            5,
            1,
            Duration::from_secs(10),
        );
        let key = ScopeKey::build(&policy, None, "192.0.2.10");
        (clock, store, key)
    }

    #[test]
    fn test_new_bucket_starts_full() {
        let update = decide(None, &params(5), T0);
        assert_eq!(
            update,
            BucketUpdate::Store(BucketState {
                tokens: 4,
                last_refill_ms: T0,
            })
        );
    }

    #[test]
    fn test_refill_advances_by_whole_intervals() {
        let state = BucketState {
            tokens: 0,
            last_refill_ms: T0,
        };
        let refilled = refill(state, &params(5), T0 + 25_000);
        assert_eq!(refilled.tokens, 2);
        assert_eq!(refilled.last_refill_ms, T0 + 20_000);

        let unchanged = refill(state, &params(5), T0 + 9_999);
        assert_eq!(unchanged, state);
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let state = BucketState {
            tokens: 4,
            last_refill_ms: T0,
        };
        let refilled = refill(state, &params(5), T0 + 100_000);
        assert_eq!(refilled.tokens, 5);
        assert_eq!(refilled.last_refill_ms, T0 + 100_000);
    }

    #[test]
    fn test_empty_bucket_keeps_state() {
        let state = BucketState {
            tokens: 0,
            last_refill_ms: T0,
        };
        assert_eq!(
            decide(Some(state), &params(5), T0 + 5_000),
            BucketUpdate::Keep(state)
        );
    }

    #[test]
    fn test_reset_seconds() {
        let state = BucketState {
            tokens: 0,
            last_refill_ms: T0,
        };
        assert_eq!(reset_seconds(&state, &params(5), T0), 10);
        assert_eq!(reset_seconds(&state, &params(5), T0 + 2_500), 8);
        assert_eq!(reset_seconds(&state, &params(5), T0 + 9_001), 1);
    }

    #[test]
    fn test_ttl() {
        assert_eq!(params(5).ttl(), Duration::from_secs(100));
        assert_eq!(
            BucketParams::new(5, 2, Duration::from_secs(10)).ttl(),
            Duration::from_secs(60)
        );
        assert_eq!(
            BucketParams::new(1, 10, Duration::from_secs(10)).ttl(),
            Duration::from_secs(20)
        );
    }

    #[test]
    fn test_huge_interval_saturates() {
        let params = BucketParams::new(1, 1, Duration::MAX);
        assert_eq!(params.refill_interval_ms, i64::MAX);

        let state = BucketState {
            tokens: 0,
            last_refill_ms: T0,
        };
        assert_eq!(refill(state, &params, T0 + 1_000_000), state);
    }

    #[tokio::test]
    async fn test_burst_then_drain() {
        let (clock, store, key) = setup();

        for expected in [4, 3, 2, 1, 0] {
            let decision = evaluate(&store, &key, params(5), clock.now_millis())
                .await
                .unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.quota.remaining, expected);
            assert_eq!(decision.quota.limit, 5);
        }

        let rejected = evaluate(&store, &key, params(5), clock.now_millis())
            .await
            .unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.quota.remaining, 0);
        assert_eq!(rejected.quota.reset_seconds, 10);

        clock.advance(Duration::from_secs(10));
        let refilled = evaluate(&store, &key, params(5), clock.now_millis())
            .await
            .unwrap();
        assert!(refilled.allowed);
        assert_eq!(refilled.quota.remaining, 0);

        let rejected = evaluate(&store, &key, params(5), clock.now_millis())
            .await
            .unwrap();
        assert!(!rejected.allowed);
    }

    #[tokio::test]
    async fn test_fractional_refill_is_preserved() {
        let (clock, store, key) = setup();
        for _ in 0..5 {
            assert!(evaluate(&store, &key, params(5), clock.now_millis())
                .await
                .unwrap()
                .allowed);
        }

        clock.advance(Duration::from_secs(5));
        let halfway = evaluate(&store, &key, params(5), clock.now_millis())
            .await
            .unwrap();
        assert!(!halfway.allowed);
        assert_eq!(halfway.quota.reset_seconds, 5);

        clock.advance(Duration::from_secs(5));
        let decision = evaluate(&store, &key, params(5), clock.now_millis())
            .await
            .unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn test_partial_progress_survives_admission() {
        let (clock, store, key) = setup();
        let small = params(2);

        assert!(evaluate(&store, &key, small, clock.now_millis()).await.unwrap().allowed);
        assert!(evaluate(&store, &key, small, clock.now_millis()).await.unwrap().allowed);

        // 15s in: one refill applied, 5s of progress carried to the next
        clock.advance(Duration::from_secs(15));
        let decision = evaluate(&store, &key, small, clock.now_millis()).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.quota.remaining, 0);
        assert_eq!(decision.quota.reset_seconds, 5);

        clock.advance(Duration::from_secs(5));
        assert!(evaluate(&store, &key, small, clock.now_millis()).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_idle_bucket_expires_to_full() {
        let (clock, store, key) = setup();
        for _ in 0..5 {
            evaluate(&store, &key, params(5), clock.now_millis())
                .await
                .unwrap();
        }
        clock.advance(params(5).ttl());
        assert!(store.is_empty());

        let decision = evaluate(&store, &key, params(5), clock.now_millis())
            .await
            .unwrap();
        assert_eq!(decision.quota.remaining, 4);
    }
}
