//! JSON envelope exchanged over relay connections.
//!
//! Every WebSocket text frame carries exactly one envelope:
//!
//! ```text
//! {"type": "agent_sync", "agent": "cursor", "payload": {...}, "timestamp": "2024-01-01T00:00:00Z"}
//! ```
//!
//! All four fields are required. `payload` is opaque to the relay; it may be
//! any JSON value including `null`. Extra top-level fields are ignored when
//! parsing. The relay forwards the sender's original text, so [`Envelope::to_json`]
//! is only used for envelopes the relay builds itself.

use crate::types::{AgentKind, MessageType};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One relay message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Logical sender.
    pub agent: AgentKind,
    /// Producer-defined data.
    pub payload: Value,
    /// ISO-8601 send time, set by whoever built the envelope.
    pub timestamp: String,
}

/// Errors produced while reading or writing envelopes.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Text was not JSON, or did not match the envelope schema.
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The `type` field is outside the documented set.
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

impl EnvelopeError {
    /// Short label for logs and metrics.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::UnknownType(_) => "unknown_type",
        }
    }
}

/// Current UTC time in RFC 3339 form with millisecond precision.
#[must_use]
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Envelope {
    /// Build an envelope stamped with the current time.
    #[must_use]
    pub fn new(kind: MessageType, agent: AgentKind, payload: Value) -> Self {
        Self {
            kind,
            agent,
            payload,
            timestamp: now_timestamp(),
        }
    }

    /// A `state_update` from an unnamed producer.
    #[must_use]
    pub fn state_update(state: Value) -> Self {
        Self::new(MessageType::StateUpdate, AgentKind::Unknown, state)
    }

    /// The greeting sent to a client right after it is registered.
    #[must_use]
    pub fn welcome(identity: &str) -> Self {
        Self::new(
            MessageType::StateUpdate,
            AgentKind::Relay,
            serde_json::json!({
                "message": format!("Connected to Aegis relay as {identity}"),
                "client_id": identity,
            }),
        )
    }

    /// Reply to a `ping`, echoing its payload.
    #[must_use]
    pub fn pong(payload: Value) -> Self {
        Self::new(MessageType::Pong, AgentKind::Relay, payload)
    }

    /// Parse one envelope from a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Malformed`] if the text is not JSON or any
    /// required field is missing or has the wrong JSON type.
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Parse and additionally reject types outside the documented set.
    ///
    /// # Errors
    ///
    /// Same as [`Envelope::parse`], plus [`EnvelopeError::UnknownType`].
    pub fn parse_strict(text: &str) -> Result<Self, EnvelopeError> {
        let envelope = Self::parse(text)?;
        if !envelope.kind.is_known() {
            return Err(EnvelopeError::UnknownType(envelope.kind.to_string()));
        }
        Ok(envelope)
    }

    /// Serialize to the wire form.
    ///
    /// # Errors
    ///
    /// Fails only if the payload holds something JSON cannot represent,
    /// which a [`Value`] never does in practice.
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }
}
