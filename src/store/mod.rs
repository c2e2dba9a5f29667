//! Counter store adapters.
//!
//! The admission gate depends only on the [`CounterStore`] contract: an atomic
//! increment and a set-TTL-only-if-unset expire. All cross-instance
//! correctness lives in the store's atomicity, so every implementation must be
//! safe to call concurrently from many tasks and processes.

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis::{RedisStore, RedisStoreConfig};

/// Errors surfaced by a counter store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached in time: network failure, timeout, or a
    /// connection that has not been established yet.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    /// The store answered, but not with something the gate can use.
    #[error("unexpected counter store response: {0}")]
    Unexpected(String),
}

impl StoreError {
    /// Whether this error falls under the configured failure policy.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Unavailable(_) => "unavailable",
            StoreError::Unexpected(_) => "unexpected",
        }
    }
}

/// Outcome of [`CounterStore::increment_with_ttl`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counted {
    /// Post-increment value
    pub count: u64,
    /// Why the TTL of a fresh counter could not be set
    pub ttl_error: Option<StoreError>,
}

/// Contract over an external atomic-increment/expire key-value store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment the counter at `key`, creating it at zero first if
    /// absent, and return the post-increment value.
    async fn increment(&self, key: &str) -> Result<u64, StoreError>;

    /// Set a time-to-live on `key` only if it currently has none.
    ///
    /// Returns whether the TTL was applied. Calling this on a key that already
    /// carries a TTL is a harmless no-op, so concurrent callers may all call it.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Increment `key` and make sure a counter created by this call carries
    /// `ttl`.
    ///
    /// By default this is `increment` followed by `expire` when the count is
    /// 1. A failed expire does not undo the increment; it is handed back in
    /// [`Counted::ttl_error`]. Stores that can do both in one atomic step
    /// override this, so a counter can never be left without a TTL.
    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<Counted, StoreError> {
        let count = self.increment(key).await?;
        let ttl_error = if count == 1 {
            self.expire(key, ttl).await.err()
        } else {
            None
        };
        Ok(Counted { count, ttl_error })
    }

    /// Name used in logs and metrics.
    fn backend_name(&self) -> &'static str;
}
