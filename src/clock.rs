//! Wall-clock abstraction.
//!
//! Window boundaries and in-process TTLs are computed from a [`Clock`] that is
//! injected at construction, so tests can move time forward without sleeping.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

/// Source of the current time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// The current instant as UTC wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Create a clock frozen at the given Unix timestamp (seconds).
    ///
    /// # Panics
    ///
    /// Panics if `secs` is outside the range chrono can represent.
    pub fn at_unix(secs: i64) -> Self {
        match Utc.timestamp_opt(secs, 0).single() {
            Some(now) => Self::new(now),
            None => panic!("unix timestamp {secs} is out of range"),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let step = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        let mut now = self.now.lock();
        *now += step;
    }

    /// Jump to an arbitrary instant, possibly backwards.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
