//! Turnstile - Request Admission Gate
//!
//! This crate implements the fixed-window rate limiter that guards the
//! finance tracker API. Every gate instance is stateless: counters live in a
//! shared key-value store (Redis) and each decision is a single atomic
//! increment, so any number of instances can run side by side.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod ratelimit;
pub mod server;
pub mod store;
