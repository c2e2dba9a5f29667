//! Admission middleware for axum routers.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use tracing::{debug, error};

use super::identity::{IdentityExtractor, PeerAddress};
use crate::error::TurnstileError;
use crate::ratelimit::{AdmissionGate, Decision};

/// Body message of a rejected request.
pub const REJECTION_MESSAGE: &str = "Too many requests, please try again later.";

/// State shared by every invocation of [`enforce_rate_limit`].
#[derive(Clone)]
pub struct RateLimitState {
    gate: Arc<AdmissionGate>,
    extractor: Arc<dyn IdentityExtractor>,
}

impl RateLimitState {
    /// Gate requests by peer address.
    pub fn new(gate: Arc<AdmissionGate>) -> Self {
        Self {
            gate,
            extractor: Arc::new(PeerAddress),
        }
    }

    /// Replace the identity extractor.
    pub fn with_extractor(mut self, extractor: Arc<dyn IdentityExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn gate(&self) -> &Arc<AdmissionGate> {
        &self.gate
    }
}

impl std::fmt::Debug for RateLimitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitState")
            .field("gate", &self.gate)
            .finish()
    }
}

/// Wrap every route of `router` in the admission gate.
pub fn rate_limited<S>(router: Router<S>, state: RateLimitState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(axum::middleware::from_fn_with_state(
        state,
        enforce_rate_limit,
    ))
}

/// Middleware that admits or rejects each request before it reaches a route.
///
/// Makes exactly one [`AdmissionGate::admit`] call per request. Allowed
/// requests are forwarded untouched; rejected ones get a 429. A store error
/// the failure policy does not cover fails the request with a 500.
pub async fn enforce_rate_limit(
    State(state): State<RateLimitState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let identity = state.extractor.extract(&request);

    match state.gate.admit(&identity).await {
        Ok(decision) if decision.is_allowed() => next.run(request).await,
        Ok(decision) => {
            debug!(
                identity = %identity,
                method = %request.method(),
                path = %request.uri().path(),
                "Rejecting request"
            );
            rate_limit_response(&decision)
        }
        Err(e) => {
            error!(
                identity = %identity,
                path = %request.uri().path(),
                error = %e,
                "Admission check failed"
            );
            TurnstileError::Store(e).into_response()
        }
    }
}

/// 429 response for a rejected request.
pub fn rate_limit_response(decision: &Decision) -> Response {
    // Round up so clients never retry inside the window that rejected them
    let retry_after = decision.reset_after.as_millis().div_ceil(1000).max(1);

    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, retry_after.to_string())],
        Json(json!({ "message": REJECTION_MESSAGE })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::Verdict;
    use std::time::Duration;

    fn rejected(reset_after: Duration) -> Decision {
        Decision {
            verdict: Verdict::Reject,
            count: Some(4),
            limit: 3,
            reset_after,
            degraded: false,
        }
    }

    #[tokio::test]
    async fn test_rejection_response_shape() {
        let response = rate_limit_response(&rejected(Duration::from_secs(42)));
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body, json!({ "message": REJECTION_MESSAGE }));
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let response = rate_limit_response(&rejected(Duration::from_millis(1500)));
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");

        let response = rate_limit_response(&rejected(Duration::ZERO));
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    }
}
