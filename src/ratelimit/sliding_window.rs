//! Sliding-window log algorithm.
//!
//! Every admitted request is recorded as one entry scored with its arrival
//! time in epoch milliseconds. A request is admitted while fewer than
//! `max_requests` entries fall within `(now - window, now]`. Rejected
//! requests leave no entry behind.

use std::time::Duration;

use serde::Deserialize;
use tracing::trace;
use uuid::Uuid;

use super::decision::QuotaTelemetry;
use super::scope::ScopeKey;
use crate::clock::duration_millis;
use crate::store::{QuotaStore, StoreResult, WindowAdmission};

/// How the window check and the insert reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlidingWindowMode {
    /// One atomic trim, count and insert per request. Never exceeds the
    /// limit.
    #[default]
    Atomic,
    /// Separate trim-and-count, insert and expire calls. Concurrent
    /// requests on one key may overshoot the limit by up to the number of
    /// racing callers minus one.
    Relaxed,
}

/// Outcome of one sliding-window evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    pub allowed: bool,
    pub quota: QuotaTelemetry,
}

/// Keys expire after two windows without an admitted request.
pub fn key_ttl(window: Duration) -> Duration {
    window.saturating_mul(2)
}

/// Seconds until the oldest in-window entry leaves the window.
pub fn reset_seconds(oldest_score: Option<i64>, window_ms: i64, now: i64) -> u64 {
    match oldest_score {
        Some(oldest) => {
            let remaining_ms = oldest.saturating_add(window_ms).saturating_sub(now).max(0);
            (remaining_ms as u64).div_ceil(1000)
        }
        None => 0,
    }
}

/// Unique member for a request arriving at `now`.
fn entry_member(now: i64) -> String {
    format!("{}-{}", now, Uuid::new_v4())
}

/// Evaluate one request against the window stored at `key`.
pub async fn evaluate(
    store: &dyn QuotaStore,
    key: &ScopeKey,
    max_requests: u64,
    window: Duration,
    now: i64,
    mode: SlidingWindowMode,
) -> StoreResult<WindowDecision> {
    let window_ms = duration_millis(window);
    let window_start = now.saturating_sub(window_ms);

    trace!(
        key = %key,
        max_requests,
        window_ms,
        mode = ?mode,
        "Evaluating sliding window"
    );

    match mode {
        SlidingWindowMode::Atomic => {
            let admission = WindowAdmission {
                window_start,
                now,
                member: entry_member(now),
                max_requests,
                ttl: key_ttl(window),
            };
            let outcome = store.record_within_limit(key.as_str(), &admission).await?;
            let remaining = if outcome.admitted {
                max_requests.saturating_sub(outcome.count)
            } else {
                0
            };

            Ok(WindowDecision {
                allowed: outcome.admitted,
                quota: QuotaTelemetry {
                    limit: max_requests,
                    remaining,
                    reset_seconds: reset_seconds(outcome.oldest_score, window_ms, now),
                },
            })
        }
        SlidingWindowMode::Relaxed => {
            let count = store
                .trim_and_count(key.as_str(), window_start, now)
                .await?;
            // The oldest entry is not read back in this mode, so the full
            // window is reported as an upper bound.
            let reset_seconds = (window_ms.max(0) as u64).div_ceil(1000);

            if count >= max_requests {
                return Ok(WindowDecision {
                    allowed: false,
                    quota: QuotaTelemetry {
                        limit: max_requests,
                        remaining: 0,
                        reset_seconds,
                    },
                });
            }

            store
                .insert_scored(key.as_str(), &entry_member(now), now)
                .await?;
            store.set_expiry(key.as_str(), key_ttl(window)).await?;

            Ok(WindowDecision {
                allowed: true,
                quota: QuotaTelemetry {
                    limit: max_requests,
                    remaining: max_requests.saturating_sub(count + 1),
                    reset_seconds,
                },
            })
        }
    }
}
