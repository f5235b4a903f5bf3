//! Wall-clock abstraction.
//!
//! Quota records are scored with epoch milliseconds so that every instance
//! sharing a store agrees on the timeline. Tests drive time through
//! [`MockClock`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Whole milliseconds in `duration`, saturating at `i64::MAX`.
pub fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Source of the current time in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Manually advanced clock.
///
/// Clones share the same underlying time, so a test can hand one clone to
/// the engine and store while advancing another.
#[derive(Debug, Clone)]
pub struct MockClock {
    now: Arc<Mutex<i64>>,
}

impl MockClock {
    /// Create a mock clock starting at `start_millis`.
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: Arc::new(Mutex::new(start_millis)),
        }
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = now.saturating_add(duration_millis(by));
    }

    /// Set the clock to an absolute epoch-millisecond value.
    pub fn set(&self, millis: i64) {
        *self.now.lock() = millis;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new(1_700_000_000_000)
    }
}

impl Clock for MockClock {
    fn now_millis(&self) -> i64 {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_epoch_millis() {
        let now = SystemClock::new().now_millis();
        // 2020-01-01T00:00:00Z
        assert!(now > 1_577_836_800_000);
    }

    #[test]
    fn test_mock_clock_shared_between_clones() {
        let clock = MockClock::new(1_000);
        let other = clock.clone();

        other.advance(Duration::from_millis(250));
        assert_eq!(clock.now_millis(), 1_250);

        clock.set(5_000);
        assert_eq!(other.now_millis(), 5_000);
    }

    #[test]
    fn test_duration_millis_saturates() {
        assert_eq!(duration_millis(Duration::from_millis(1_500)), 1_500);
        assert_eq!(duration_millis(Duration::MAX), i64::MAX);
        assert_eq!(duration_millis(Duration::from_secs(u64::MAX / 1_000)), i64::MAX);
    }
}
