//! Rust Sandbox Proxy - header-routed traffic isolation for shared test environments
//!
//! Requests carrying a route key are sent to the sandbox services registered
//! for that key; everything else goes to the baseline target. Routing rules
//! are swapped atomically at runtime from a control plane feed, and routing
//! and tracing context is carried across HTTP and gRPC hops.

pub mod admin;
pub mod admin_listener;
pub mod backoff;
pub mod circuit_breaker;
pub mod config;
pub mod connection;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod propagation;
pub mod protocol;
pub mod router;
pub mod rules;
pub mod service;
pub mod sync;
pub mod transport;
