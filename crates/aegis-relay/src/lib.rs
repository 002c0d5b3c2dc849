//! Aegis relay: local WebSocket broker that fans JSON envelopes out between
//! editor-integrated agents.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Envelope fanout and inbound validation.
pub mod broker;
/// CLI argument parsing and relay configuration.
pub mod config;
mod connection;
/// Error types for relay operations.
pub mod error;
/// Prometheus metrics and the health/readiness endpoint.
pub mod metrics;
mod ratelimit;
/// Identity-keyed table of connected clients.
pub mod registry;
/// Lifecycle handle: start, broadcast, count, close.
pub mod relay;
/// Accept loop and shared relay state.
pub mod server;
/// Readable in-process counters.
pub mod stats;

pub use broker::BroadcastReport;
pub use config::{DuplicateIdentityPolicy, RelayConfig, UnknownTypePolicy};
pub use error::RelayError;
pub use relay::Relay;
