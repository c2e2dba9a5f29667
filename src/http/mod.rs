//! HTTP surface: identity extraction, the admission middleware, and the
//! service router.

mod identity;
mod middleware;
mod routes;

pub use identity::{extractor_for, ForwardedFor, IdentityExtractor, PeerAddress};
pub use middleware::{
    enforce_rate_limit, rate_limit_response, rate_limited, RateLimitState, REJECTION_MESSAGE,
};
pub use routes::build_router;
