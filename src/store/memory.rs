//! In-process counter store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::trace;

use super::{CounterStore, StoreError};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone, Copy)]
struct Slot {
    count: u64,
    expires_at: Option<DateTime<Utc>>,
}

impl Slot {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// A counter store held in process memory.
///
/// Mirrors the Redis semantics the gate relies on: `increment` behaves like
/// `INCR` and `expire` only applies to keys without a TTL. Counters are only
/// shared by gates in the same process, so this suits single-instance
/// deployments and tests.
#[derive(Debug)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a store that reads the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store that evaluates TTLs against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: DashMap::new(),
            clock,
        }
    }

    /// Current value of a live counter.
    pub fn count(&self, key: &str) -> Option<u64> {
        let now = self.clock.now();
        self.slots
            .get(key)
            .filter(|slot| !slot.is_expired(now))
            .map(|slot| slot.count)
    }

    /// Remaining time-to-live of a live counter, `None` if absent or unset.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let slot = self.slots.get(key)?;
        let expires_at = slot.expires_at?;
        (expires_at - now).to_std().ok()
    }

    /// Number of stored counters, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the store holds no counters at all.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop every expired counter and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.is_expired(now));
        before.saturating_sub(self.slots.len())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let mut slot = self.slots.entry(key.to_string()).or_insert(Slot {
            count: 0,
            expires_at: None,
        });

        if slot.is_expired(now) {
            *slot = Slot {
                count: 0,
                expires_at: None,
            };
        }

        slot.count = slot
            .count
            .checked_add(1)
            .ok_or_else(|| StoreError::Unexpected(format!("counter overflow at {key}")))?;

        trace!(key = %key, count = slot.count, "Incremented in-memory counter");
        Ok(slot.count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::Unexpected(format!("invalid ttl: {e}")))?;

        let Some(mut slot) = self.slots.get_mut(key) else {
            return Ok(false);
        };

        if slot.is_expired(now) || slot.expires_at.is_some() {
            return Ok(false);
        }

        slot.expires_at = Some(now + ttl);
        Ok(true)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn test_store() -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let store = MemoryStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_increment_creates_and_counts() {
        let (_, store) = test_store();

        assert_eq!(store.increment("k").await.unwrap(), 1);
        assert_eq!(store.increment("k").await.unwrap(), 2);
        assert_eq!(store.count("k"), Some(2));
        assert_eq!(store.count("other"), None);
    }

    #[tokio::test]
    async fn test_expire_only_applies_once() {
        let (clock, store) = test_store();
        store.increment("k").await.unwrap();

        assert!(store.expire("k", Duration::from_secs(60)).await.unwrap());

        clock.advance(Duration::from_secs(30));
        // A second expire must not extend the original deadline
        assert!(!store.expire("k", Duration::from_secs(60)).await.unwrap());
        assert_eq!(store.ttl("k"), Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_expire_missing_key_is_noop() {
        let (_, store) = test_store();
        assert!(!store.expire("missing", Duration::from_secs(60)).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_expired_counter_restarts_at_one() {
        let (clock, store) = test_store();
        for _ in 0..5 {
            store.increment("k").await.unwrap();
        }
        store.expire("k", Duration::from_secs(60)).await.unwrap();

        clock.advance(Duration::from_secs(60));
        assert_eq!(store.count("k"), None);
        assert_eq!(store.increment("k").await.unwrap(), 1);

        // The restarted counter has no TTL yet, so expire applies again
        assert!(store.expire("k", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (clock, store) = test_store();
        store.increment("short").await.unwrap();
        store.expire("short", Duration::from_secs(1)).await.unwrap();
        store.increment("forever").await.unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.count("forever"), Some(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let (_, store) = test_store();
        let store = Arc::new(store);

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment("hot").await.unwrap() })
            })
            .collect();

        let mut seen = Vec::new();
        for task in tasks {
            seen.push(task.await.unwrap());
        }
        seen.sort_unstable();

        assert_eq!(store.count("hot"), Some(200));
        // Every post-increment value is observed exactly once
        assert_eq!(seen, (1..=200).collect::<Vec<u64>>());
    }
}
