//! Shared quota store.
//!
//! The admission engine keeps all quota state in a store shared by every
//! instance of the service. This module defines the primitives the
//! algorithms need and provides two implementations: [`RedisStore`] for
//! multi-instance deployments and [`MemoryStore`] for a single process.

mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::ratelimit::token_bucket::{self, BucketParams};

pub use memory::MemoryStore;
pub use redis_store::{RedisStore, RedisStoreConfig};

/// Errors raised by quota store implementations.
///
/// Every variant is an infrastructure failure; the engine logs it and
/// admits the request.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("quota store unavailable: {0}")]
    Unavailable(String),

    #[error("quota store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed quota record at '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persisted state of a token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    /// Whole tokens currently available.
    pub tokens: u64,
    /// Epoch milliseconds of the last whole-interval refill.
    pub last_refill_ms: i64,
}

/// Result of a read-modify-write on a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketUpdate {
    /// Persist the new state (with a refreshed TTL).
    Store(BucketState),
    /// Leave the stored record untouched; the state is reported only.
    Keep(BucketState),
}

impl BucketUpdate {
    pub fn state(&self) -> BucketState {
        match self {
            BucketUpdate::Store(state) | BucketUpdate::Keep(state) => *state,
        }
    }

    pub fn is_stored(&self) -> bool {
        matches!(self, BucketUpdate::Store(_))
    }
}

/// Parameters of a single atomic sliding-window admission.
#[derive(Debug, Clone)]
pub struct WindowAdmission {
    /// Entries scored at or below this value are discarded.
    pub window_start: i64,
    /// Score of the new entry and upper bound of the counted range.
    pub now: i64,
    /// Unique member recorded for this request.
    pub member: String,
    pub max_requests: u64,
    /// Expiry applied to the key after a successful insert.
    pub ttl: Duration,
}

/// Outcome of [`QuotaStore::record_within_limit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    pub admitted: bool,
    /// Entries inside the window after the operation.
    pub count: u64,
    /// Score of the oldest entry still inside the window.
    pub oldest_score: Option<i64>,
}

/// Token-bucket update applied by [`QuotaStore::atomic_update`].
///
/// Plain data, so a remote store can apply it server-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketTake {
    pub params: BucketParams,
    /// Epoch milliseconds of the request.
    pub now: i64,
}

impl BucketTake {
    pub fn new(params: BucketParams, now: i64) -> Self {
        Self { params, now }
    }

    /// Refill `current` and take one token if available.
    pub fn apply(&self, current: Option<BucketState>) -> BucketUpdate {
        token_bucket::decide(current, &self.params, self.now)
    }

    /// Expiry refreshed on every stored update.
    pub fn ttl(&self) -> Duration {
        self.params.ttl()
    }
}

/// Primitive operations the admission algorithms run against shared state.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Remove entries scored `<= cutoff_low` and count those in
    /// `(cutoff_low, cutoff_high]`.
    async fn trim_and_count(
        &self,
        key: &str,
        cutoff_low: i64,
        cutoff_high: i64,
    ) -> StoreResult<u64>;

    /// Add `member` with `score` to the ordered set at `key`.
    async fn insert_scored(&self, key: &str, member: &str, score: i64) -> StoreResult<()>;

    /// Set the expiry of `key`. A missing key is left missing.
    async fn set_expiry(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    /// Trim, count and conditionally insert in one atomic step.
    async fn record_within_limit(
        &self,
        key: &str,
        admission: &WindowAdmission,
    ) -> StoreResult<WindowOutcome>;

    /// All-or-nothing read-modify-write of the bucket at `key`.
    ///
    /// Stored updates refresh the key's expiry to [`BucketTake::ttl`].
    async fn atomic_update(&self, key: &str, take: &BucketTake) -> StoreResult<BucketUpdate>;

    /// Verify the store is reachable.
    async fn ping(&self) -> StoreResult<()>;
}
