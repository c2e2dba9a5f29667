//! Prometheus metrics for admission decisions and counter store health.
//!
//! Store failures are absorbed by the failure policy, so these counters are
//! the only place an operator sees them when the gate fails open.

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Verdict labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DecisionLabels {
    pub verdict: String,
}

/// Store error labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StoreErrorLabels {
    pub operation: String,
    pub kind: String,
}

/// Failure policy labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PolicyLabels {
    pub policy: String,
}

/// Gate metrics and the registry that exposes them.
#[derive(Debug)]
pub struct Metrics {
    registry: Registry,

    /// Decisions by verdict.
    pub decisions: Family<DecisionLabels, Counter>,

    /// Counter store errors by operation and kind.
    pub store_errors: Family<StoreErrorLabels, Counter>,

    /// Decisions produced by the failure policy.
    pub failure_policy: Family<PolicyLabels, Counter>,

    /// Latency of the increment round trip.
    pub store_latency_seconds: Histogram,
}

impl Metrics {
    /// Create a new metrics registry.
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("turnstile");

        let decisions = Family::<DecisionLabels, Counter>::default();
        registry.register(
            "decisions",
            "Admission decisions by verdict",
            decisions.clone(),
        );

        let store_errors = Family::<StoreErrorLabels, Counter>::default();
        registry.register(
            "store_errors",
            "Counter store errors by operation and kind",
            store_errors.clone(),
        );

        let failure_policy = Family::<PolicyLabels, Counter>::default();
        registry.register(
            "failure_policy",
            "Decisions made by the failure policy while the store was unavailable",
            failure_policy.clone(),
        );

        let store_latency_seconds = Histogram::new(exponential_buckets(0.0001, 2.0, 14));
        registry.register(
            "store_latency_seconds",
            "Counter store increment latency in seconds",
            store_latency_seconds.clone(),
        );

        Self {
            registry,
            decisions,
            store_errors,
            failure_policy,
            store_latency_seconds,
        }
    }

    /// Record an admission decision.
    pub fn record_decision(&self, verdict: &str) {
        self.decisions
            .get_or_create(&DecisionLabels {
                verdict: verdict.to_string(),
            })
            .inc();
    }

    /// Record a counter store error.
    pub fn record_store_error(&self, operation: &str, kind: &str) {
        self.store_errors
            .get_or_create(&StoreErrorLabels {
                operation: operation.to_string(),
                kind: kind.to_string(),
            })
            .inc();
    }

    /// Record a decision taken by the failure policy.
    pub fn record_failure_policy(&self, policy: &str) {
        self.failure_policy
            .get_or_create(&PolicyLabels {
                policy: policy.to_string(),
            })
            .inc();
    }

    /// Record the latency of one store round trip.
    pub fn record_store_latency(&self, seconds: f64) {
        self.store_latency_seconds.observe(seconds);
    }

    /// Number of decisions recorded with `verdict`.
    pub fn decisions_total(&self, verdict: &str) -> u64 {
        self.decisions
            .get_or_create(&DecisionLabels {
                verdict: verdict.to_string(),
            })
            .get()
    }

    /// Number of store errors recorded for `operation` and `kind`.
    pub fn store_errors_total(&self, operation: &str, kind: &str) -> u64 {
        self.store_errors
            .get_or_create(&StoreErrorLabels {
                operation: operation.to_string(),
                kind: kind.to_string(),
            })
            .get()
    }

    /// Encode metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
