//! In-process quota store.
//!
//! Mirrors the semantics of the Redis store (ordered sets, expiring keys,
//! atomic per-key updates) for single-instance deployments and tests. Each
//! operation runs under the key's shard lock, which makes every primitive
//! atomic with respect to other callers on the same key.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::{
    BucketState, BucketTake, BucketUpdate, QuotaStore, StoreError, StoreResult,
    WindowAdmission, WindowOutcome,
};
use crate::clock::{duration_millis, Clock};

#[derive(Debug)]
enum RecordValue {
    /// Sliding-window log ordered by (score, member).
    Window(BTreeSet<(i64, String)>),
    Bucket(BucketState),
}

#[derive(Debug)]
struct Record {
    value: RecordValue,
    /// Epoch milliseconds after which the record no longer exists.
    expires_at: Option<i64>,
}

impl Record {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn window_mut(&mut self, key: &str) -> StoreResult<&mut BTreeSet<(i64, String)>> {
        match &mut self.value {
            RecordValue::Window(entries) => Ok(entries),
            RecordValue::Bucket(_) => Err(wrong_type(key, "sliding window")),
        }
    }
}

fn wrong_type(key: &str, expected: &str) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        reason: format!("record is not a {}", expected),
    }
}

fn expiry_at(now: i64, ttl: Duration) -> i64 {
    now.saturating_add(duration_millis(ttl))
}

/// Remove entries scored at or below `cutoff_low`.
fn trim(entries: &mut BTreeSet<(i64, String)>, cutoff_low: i64) {
    entries.retain(|(score, _)| *score > cutoff_low);
}

fn count_in(entries: &BTreeSet<(i64, String)>, low_exclusive: i64, high_inclusive: i64) -> u64 {
    entries
        .iter()
        .filter(|(score, _)| *score > low_exclusive && *score <= high_inclusive)
        .count() as u64
}

/// Quota store held in process memory.
pub struct MemoryStore {
    records: DashMap<String, Record>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store whose expiry follows `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.records.iter().filter(|r| !r.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired record. Returns how many were removed.
    ///
    /// Expired records are already invisible to readers; this only releases
    /// their memory.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        let purged = before.saturating_sub(self.records.len());
        if purged > 0 {
            trace!(purged, "Purged expired quota records");
        }
        purged
    }

    /// Remaining time to live of `key`, if it exists and has an expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now_millis();
        let record = self.records.get(key)?;
        if record.is_expired(now) {
            return None;
        }
        record
            .expires_at
            .map(|at| Duration::from_millis((at - now).max(0) as u64))
    }

    /// Clear all records.
    pub fn clear(&self) {
        self.records.clear();
    }

    /// Look up a live record for mutation, treating expired records as absent.
    fn live_entry(&self, key: &str, now: i64) -> Entry<'_, String, Record> {
        let entry = self.records.entry(key.to_string());
        match entry {
            Entry::Occupied(occupied) if occupied.get().is_expired(now) => {
                occupied.remove();
                self.records.entry(key.to_string())
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn trim_and_count(
        &self,
        key: &str,
        cutoff_low: i64,
        cutoff_high: i64,
    ) -> StoreResult<u64> {
        let now = self.clock.now_millis();
        match self.live_entry(key, now) {
            Entry::Vacant(_) => Ok(0),
            Entry::Occupied(mut occupied) => {
                let entries = occupied.get_mut().window_mut(key)?;
                trim(entries, cutoff_low);
                let count = count_in(entries, cutoff_low, cutoff_high);
                if entries.is_empty() {
                    occupied.remove();
                }
                Ok(count)
            }
        }
    }

    async fn insert_scored(&self, key: &str, member: &str, score: i64) -> StoreResult<()> {
        let now = self.clock.now_millis();
        match self.live_entry(key, now) {
            Entry::Vacant(vacant) => {
                let mut entries = BTreeSet::new();
                entries.insert((score, member.to_string()));
                vacant.insert(Record {
                    value: RecordValue::Window(entries),
                    expires_at: None,
                });
            }
            Entry::Occupied(mut occupied) => {
                let entries = occupied.get_mut().window_mut(key)?;
                // An ordered set holds a member once; re-adding updates its score.
                entries.retain(|(_, existing)| existing != member);
                entries.insert((score, member.to_string()));
            }
        }
        Ok(())
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let now = self.clock.now_millis();
        if let Entry::Occupied(mut occupied) = self.live_entry(key, now) {
            occupied.get_mut().expires_at = Some(expiry_at(now, ttl));
        }
        Ok(())
    }

    async fn record_within_limit(
        &self,
        key: &str,
        admission: &WindowAdmission,
    ) -> StoreResult<WindowOutcome> {
        let now = self.clock.now_millis();
        let mut record = self.live_entry(key, now).or_insert_with(|| Record {
            value: RecordValue::Window(BTreeSet::new()),
            expires_at: None,
        });

        let entries = record.window_mut(key)?;
        trim(entries, admission.window_start);
        let count = count_in(entries, admission.window_start, admission.now);

        let admitted = count < admission.max_requests;
        if admitted {
            entries.insert((admission.now, admission.member.clone()));
        }

        let count = if admitted { count + 1 } else { count };
        let oldest_score = entries
            .iter()
            .find(|(score, _)| *score > admission.window_start && *score <= admission.now)
            .map(|(score, _)| *score);
        let empty = entries.is_empty();

        if admitted {
            record.expires_at = Some(expiry_at(now, admission.ttl));
        }
        drop(record);

        if empty {
            self.records
                .remove_if(key, |_, r| matches!(&r.value, RecordValue::Window(e) if e.is_empty()));
        }

        Ok(WindowOutcome {
            admitted,
            count,
            oldest_score,
        })
    }

    async fn atomic_update(&self, key: &str, take: &BucketTake) -> StoreResult<BucketUpdate> {
        let now = self.clock.now_millis();
        let ttl = take.ttl();
        match self.live_entry(key, now) {
            Entry::Vacant(vacant) => {
                let result = take.apply(None);
                if let BucketUpdate::Store(state) = result {
                    vacant.insert(Record {
                        value: RecordValue::Bucket(state),
                        expires_at: Some(expiry_at(now, ttl)),
                    });
                }
                Ok(result)
            }
            Entry::Occupied(mut occupied) => {
                let current = match &occupied.get().value {
                    RecordValue::Bucket(state) => *state,
                    RecordValue::Window(_) => return Err(wrong_type(key, "token bucket")),
                };
                let result = take.apply(Some(current));
                if let BucketUpdate::Store(state) = result {
                    let record = occupied.get_mut();
                    record.value = RecordValue::Bucket(state);
                    record.expires_at = Some(expiry_at(now, ttl));
                }
                Ok(result)
            }
        }
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
