//! Turnstile - Adaptive Distributed Admission Control
//!
//! This crate decides, for every inbound request, whether it may proceed.
//! Limits depend on the caller's tier and the endpoint, counters are kept in a
//! shared Redis store with a process-local fallback, and keys that keep
//! violating their limits are slowed down and then temporarily blocked.

pub mod admission;
pub mod config;
pub mod error;
pub mod grpc;
pub mod logging;
pub mod store;
