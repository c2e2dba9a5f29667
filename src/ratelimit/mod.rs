//! Rate limiting logic.

mod gate;
mod identity;
mod window;

pub use gate::{AdmissionGate, Decision, FailurePolicy, Verdict, DEFAULT_KEY_PREFIX};
pub use identity::{CallerIdentity, FALLBACK_IDENTITY};
pub use window::{FixedWindow, WindowKey};
