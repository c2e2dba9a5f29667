//! Caller identity.

use std::net::IpAddr;

/// Identity used when a request carries no usable origin.
pub const FALLBACK_IDENTITY: &str = "global";

/// Identifies the origin of a request for quota purposes.
///
/// Usually the client's network address. Callers that share an identity
/// share a quota, which is why the fallback sentinel puts every anonymous
/// request into one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerIdentity(String);

impl CallerIdentity {
    /// Create an identity from any string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The shared fallback identity.
    pub fn fallback() -> Self {
        Self(FALLBACK_IDENTITY.to_string())
    }

    /// Identity for a network address.
    pub fn from_ip(ip: IpAddr) -> Self {
        Self(ip.to_string())
    }

    /// The identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the fallback sentinel.
    pub fn is_fallback(&self) -> bool {
        self.0 == FALLBACK_IDENTITY
    }
}

impl std::fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallerIdentity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
