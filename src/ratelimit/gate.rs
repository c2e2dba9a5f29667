//! The admission gate.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use super::identity::CallerIdentity;
use super::window::FixedWindow;
use crate::clock::{Clock, SystemClock};
use crate::config::RateLimitingConfig;
use crate::error::{Result, TurnstileError};
use crate::metrics::Metrics;
use crate::store::{CounterStore, StoreError};

/// Default namespace for counter keys.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit:";

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Let the request through
    Allow,
    /// Turn the request away
    Reject,
}

impl Verdict {
    /// Pure decision rule: reject once the count passes the limit.
    pub fn from_count(count: u64, limit: u64) -> Self {
        if count > limit {
            Verdict::Reject
        } else {
            Verdict::Allow
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::Reject => "reject",
        }
    }
}

/// What to do when the counter store can not be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Admit every request while the store is unavailable.
    #[default]
    FailOpen,
    /// Reject every request while the store is unavailable.
    FailClosed,
}

impl FailurePolicy {
    /// The verdict this policy hands out.
    pub fn verdict(&self) -> Verdict {
        match self {
            FailurePolicy::FailOpen => Verdict::Allow,
            FailurePolicy::FailClosed => Verdict::Reject,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::FailOpen => "fail-open",
            FailurePolicy::FailClosed => "fail-closed",
        }
    }
}

/// Result of one [`AdmissionGate::admit`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Allow or reject
    pub verdict: Verdict,
    /// Counter value after this request, `None` if the store was unavailable
    pub count: Option<u64>,
    /// Configured limit
    pub limit: u64,
    /// Time until the current window ends
    pub reset_after: Duration,
    /// Whether the failure policy made this decision
    pub degraded: bool,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        self.verdict == Verdict::Allow
    }

    /// Requests left in the current window, when known.
    pub fn remaining(&self) -> Option<u64> {
        self.count.map(|count| self.limit.saturating_sub(count))
    }
}

/// Fixed-window admission gate over a shared counter store.
///
/// The gate keeps no counters of its own. Every decision is one atomic
/// increment in the store, so any number of gates, in any number of
/// processes, can share a store and still agree on each caller's count.
pub struct AdmissionGate {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    window: FixedWindow,
    limit: u64,
    failure_policy: FailurePolicy,
    key_prefix: String,
}

impl std::fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("backend", &self.store.backend_name())
            .field("window", &self.window)
            .field("limit", &self.limit)
            .field("failure_policy", &self.failure_policy)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl AdmissionGate {
    /// Create a gate allowing `limit` requests per `window`, failing open.
    pub fn new(store: Arc<dyn CounterStore>, limit: u64, window: FixedWindow) -> Result<Self> {
        if limit == 0 {
            return Err(TurnstileError::Config(
                "limit must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            store,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(Metrics::new()),
            window,
            limit,
            failure_policy: FailurePolicy::default(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        })
    }

    /// Create a gate from the rate limiting configuration section.
    pub fn from_config(store: Arc<dyn CounterStore>, config: &RateLimitingConfig) -> Result<Self> {
        let window = FixedWindow::from_secs(config.window_secs)?;
        Ok(Self::new(store, config.limit, window)?.with_failure_policy(config.failure_policy))
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> FixedWindow {
        self.window
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Decide whether `identity` may make one more request.
    ///
    /// Increments the caller's counter for the current window and compares
    /// the post-increment value against the limit; there is no separate read,
    /// so concurrent callers can never both slip under the limit. The first
    /// request of a window also sets the counter's TTL.
    ///
    /// An unavailable store is resolved by the failure policy and never
    /// returned as an error. Any other store error is.
    pub async fn admit(&self, identity: &CallerIdentity) -> std::result::Result<Decision, StoreError> {
        let now = self.clock.now();
        let key = self.window.key(identity, now).to_store_key(&self.key_prefix);
        let reset_after = self.window.until_reset(now);

        trace!(key = %key, "Checking admission");

        let started = Instant::now();
        let incremented = self
            .store
            .increment_with_ttl(&key, self.window.duration())
            .await;
        self.metrics
            .record_store_latency(started.elapsed().as_secs_f64());

        let counted = match incremented {
            Ok(counted) => counted,
            Err(e) if e.is_unavailable() => {
                return Ok(self.apply_failure_policy(identity, "increment", &e, reset_after));
            }
            Err(e) => {
                self.metrics.record_store_error("increment", e.kind());
                error!(identity = %identity, key = %key, error = %e, "Counter store increment failed");
                return Err(e);
            }
        };

        // Only the request that created the counter sets its TTL. If two
        // callers race here the store applies the first and ignores the rest.
        if let Some(e) = counted.ttl_error {
            self.ttl_failed(&key, e)?;
        }
        let count = counted.count;

        let verdict = Verdict::from_count(count, self.limit);
        self.metrics.record_decision(verdict.as_str());

        if verdict == Verdict::Reject {
            debug!(
                identity = %identity,
                key = %key,
                count = count,
                limit = self.limit,
                "Rate limit exceeded"
            );
        }

        Ok(Decision {
            verdict,
            count: Some(count),
            limit: self.limit,
            reset_after,
            degraded: false,
        })
    }

    fn ttl_failed(&self, key: &str, err: StoreError) -> std::result::Result<(), StoreError> {
        self.metrics.record_store_error("expire", err.kind());

        if err.is_unavailable() {
            // The count is already known, so the verdict stands. The key is
            // scoped to this window and is never consulted after it ends, but
            // on stores without an atomic increment it stays until evicted.
            warn!(key = %key, error = %err, "Failed to set counter TTL");
            Ok(())
        } else {
            error!(key = %key, error = %err, "Counter store expire failed");
            Err(err)
        }
    }

    fn apply_failure_policy(
        &self,
        identity: &CallerIdentity,
        operation: &str,
        err: &StoreError,
        reset_after: Duration,
    ) -> Decision {
        let verdict = self.failure_policy.verdict();

        self.metrics.record_store_error(operation, err.kind());
        self.metrics.record_failure_policy(self.failure_policy.as_str());
        self.metrics.record_decision(verdict.as_str());

        warn!(
            identity = %identity,
            backend = self.store.backend_name(),
            policy = self.failure_policy.as_str(),
            verdict = verdict.as_str(),
            error = %err,
            "Counter store unavailable, applying failure policy"
        );

        Decision {
            verdict,
            count: None,
            limit: self.limit,
            reset_after,
            degraded: true,
        }
    }
}
