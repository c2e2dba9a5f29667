//! Fixed time windows and the counter keys derived from them.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::identity::CallerIdentity;
use crate::error::{Result, TurnstileError};

/// A fixed rate limiting window.
///
/// Time is cut into non-overlapping buckets of `duration`, numbered from the
/// Unix epoch. Every request in the same bucket shares one counter. This is a
/// fixed window, not a sliding one: a client may send up to `2 × limit`
/// requests across a boundary (the tail of one bucket plus the head of the
/// next), which is an accepted approximation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FixedWindow {
    duration_secs: u64,
}

impl FixedWindow {
    /// Create a window of whole seconds.
    ///
    /// Counter store TTLs have one-second resolution, so sub-second parts are
    /// rejected rather than truncated.
    pub fn new(duration: Duration) -> Result<Self> {
        if duration.subsec_nanos() != 0 {
            return Err(TurnstileError::Config(format!(
                "window duration must be whole seconds, got {duration:?}"
            )));
        }
        Self::from_secs(duration.as_secs())
    }

    /// Create a window of `secs` seconds.
    pub fn from_secs(secs: u64) -> Result<Self> {
        if secs == 0 {
            return Err(TurnstileError::Config(
                "window duration must be at least one second".to_string(),
            ));
        }
        Ok(Self {
            duration_secs: secs,
        })
    }

    /// Length of the window.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    /// Index of the window containing `now`.
    ///
    /// Instants before the epoch (a badly skewed clock) fall into window 0.
    pub fn index(&self, now: DateTime<Utc>) -> u64 {
        let secs = now.timestamp().max(0) as u64;
        secs / self.duration_secs
    }

    /// Time left until the window containing `now` ends.
    pub fn until_reset(&self, now: DateTime<Utc>) -> Duration {
        let now_ms = now.timestamp_millis().max(0) as u64;
        let window_ms = self.duration_secs.saturating_mul(1000);
        let end_ms = (self.index(now) + 1).saturating_mul(window_ms);
        Duration::from_millis(end_ms.saturating_sub(now_ms))
    }

    /// Counter key for `identity` at `now`.
    pub fn key(&self, identity: &CallerIdentity, now: DateTime<Utc>) -> WindowKey {
        WindowKey::new(identity, self.index(now))
    }
}

/// Key of one identity's counter in one window.
///
/// Keys are never reused across windows, so a record left behind by a lost
/// TTL can not leak into a later window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    /// Caller the counter belongs to
    pub identity: CallerIdentity,
    /// Window index (`floor(now / duration)`)
    pub index: u64,
}

impl WindowKey {
    /// Create a new window key.
    pub fn new(identity: &CallerIdentity, index: u64) -> Self {
        Self {
            identity: identity.clone(),
            index,
        }
    }

    /// Key as stored, with a namespace prefix such as `ratelimit:`.
    pub fn to_store_key(&self, prefix: &str) -> String {
        format!("{prefix}{self}")
    }
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.identity, self.index)
    }
}
