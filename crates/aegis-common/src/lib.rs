//! Wire types shared by the Aegis relay and the agents that talk to it.
//!
//! This crate provides:
//! - The JSON message envelope and its validation rules ([`envelope`])
//! - Message/agent enumerations and protocol constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod envelope;
pub mod types;

pub use envelope::{Envelope, EnvelopeError};
pub use types::{AgentKind, MessageType};
