//! Caller identity extraction from HTTP requests.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Request};

use crate::config::IdentitySource;
use crate::ratelimit::CallerIdentity;

/// Derives a [`CallerIdentity`] from an inbound request.
pub trait IdentityExtractor: Send + Sync {
    fn extract(&self, request: &Request<Body>) -> CallerIdentity;
}

impl<F> IdentityExtractor for F
where
    F: Fn(&Request<Body>) -> CallerIdentity + Send + Sync,
{
    fn extract(&self, request: &Request<Body>) -> CallerIdentity {
        self(request)
    }
}

/// Uses the TCP peer address, or the fallback identity when the server was
/// not started with connect info.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerAddress;

impl IdentityExtractor for PeerAddress {
    fn extract(&self, request: &Request<Body>) -> CallerIdentity {
        peer_ip(request)
            .map(CallerIdentity::from_ip)
            .unwrap_or_else(CallerIdentity::fallback)
    }
}

/// Trusts `X-Forwarded-For` (first hop), then `X-Real-IP`, then the peer
/// address. Only safe behind a proxy that overwrites these headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardedFor;

impl IdentityExtractor for ForwardedFor {
    fn extract(&self, request: &Request<Body>) -> CallerIdentity {
        forwarded_ip(request.headers())
            .map(CallerIdentity::from_ip)
            .unwrap_or_else(|| PeerAddress.extract(request))
    }
}

/// Extractor for a configured identity source.
pub fn extractor_for(source: IdentitySource) -> Arc<dyn IdentityExtractor> {
    match source {
        IdentitySource::PeerAddress => Arc::new(PeerAddress),
        IdentitySource::ForwardedFor => Arc::new(ForwardedFor),
    }
}

fn peer_ip(request: &Request<Body>) -> Option<IpAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let first_hop = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|ip| ip.trim().parse().ok());

    first_hop.or_else(|| {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|ip| ip.trim().parse().ok())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_from(peer: Option<&str>, headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder().uri("/api/health");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let mut request = builder.body(Body::empty()).unwrap();
        if let Some(peer) = peer {
            let addr: SocketAddr = peer.parse().unwrap();
            request.extensions_mut().insert(ConnectInfo(addr));
        }
        request
    }

    #[test]
    fn test_peer_address() {
        let request = request_from(Some("1.2.3.4:50000"), &[]);
        assert_eq!(PeerAddress.extract(&request).as_str(), "1.2.3.4");
    }

    #[test]
    fn test_peer_address_falls_back() {
        let request = request_from(None, &[]);
        assert!(PeerAddress.extract(&request).is_fallback());
    }

    #[test]
    fn test_peer_address_ignores_forwarded_headers() {
        let request = request_from(Some("1.2.3.4:50000"), &[("x-forwarded-for", "9.9.9.9")]);
        assert_eq!(PeerAddress.extract(&request).as_str(), "1.2.3.4");
    }

    #[test]
    fn test_forwarded_for_first_hop() {
        let request = request_from(
            Some("10.0.0.1:50000"),
            &[("x-forwarded-for", "203.0.113.7, 10.0.0.2")],
        );
        assert_eq!(ForwardedFor.extract(&request).as_str(), "203.0.113.7");
    }

    #[test]
    fn test_forwarded_for_real_ip_then_peer() {
        let request = request_from(Some("10.0.0.1:50000"), &[("x-real-ip", "198.51.100.4")]);
        assert_eq!(ForwardedFor.extract(&request).as_str(), "198.51.100.4");

        let request = request_from(Some("10.0.0.1:50000"), &[("x-forwarded-for", "garbage")]);
        assert_eq!(ForwardedFor.extract(&request).as_str(), "10.0.0.1");
    }

    #[test]
    fn test_closure_extractor() {
        let by_header = |request: &Request<Body>| {
            request
                .headers()
                .get("x-user-id")
                .and_then(|v| v.to_str().ok())
                .map(CallerIdentity::from)
                .unwrap_or_else(CallerIdentity::fallback)
        };
        let request = request_from(None, &[("x-user-id", "user_42")]);
        assert_eq!(by_header.extract(&request).as_str(), "user_42");
    }
}
