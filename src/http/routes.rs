//! Service routes and router assembly.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tracing::error;

use super::middleware::{rate_limited, RateLimitState};
use crate::metrics::Metrics;

/// Assemble the service router.
///
/// `api` carries the application routes. Together with `/api/health` they sit
/// behind the admission gate; `/metrics` does not, so scrapes keep working
/// while clients are being throttled.
pub fn build_router(api: Router, rate_limit: RateLimitState, metrics: Arc<Metrics>) -> Router {
    let gated = rate_limited(
        api.route("/api/health", get(health_handler)),
        rate_limit,
    );

    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
        .merge(gated)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> Response {
    match metrics.encode() {
        Ok(body) => (
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
