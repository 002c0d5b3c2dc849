//! Core type definitions and protocol constants for the Aegis relay.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Upgrade-request header carrying the client's self-declared identity.
pub const IDENTITY_HEADER: &str = "x-agent-id";

/// Prefix of identities synthesized for clients that present none.
pub const GENERATED_IDENTITY_PREFIX: &str = "client_";

/// Port the relay has historically listened on.
pub const DEFAULT_PORT: u16 = 7734;

/// Envelope `type` field.
///
/// The four state kinds are the documented contract; `ping`/`pong` are used
/// by companion consumers for keep-alive. Any other string survives as
/// [`MessageType::Other`] so the relay can pass it through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Project state changed.
    StateUpdate,
    /// One agent's view, pushed for the others to merge.
    AgentSync,
    /// Drift from the captured vibe context.
    VibeAlert,
    /// Two agents touched the same logic.
    LogicCollision,
    /// Keep-alive request.
    Ping,
    /// Keep-alive response.
    Pong,
    /// A type outside the documented set.
    #[serde(untagged)]
    Other(String),
}

impl MessageType {
    /// Wire name of this type.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::StateUpdate => "state_update",
            Self::AgentSync => "agent_sync",
            Self::VibeAlert => "vibe_alert",
            Self::LogicCollision => "logic_collision",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Other(name) => name,
        }
    }

    /// Returns `true` for every variant except [`MessageType::Other`].
    #[must_use]
    pub const fn is_known(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope `agent` field: which kind of agent produced the message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Cursor editor agent.
    Cursor,
    /// Claude agent.
    Claude,
    /// Gemini agent.
    Gemini,
    /// Sender did not say.
    Unknown,
    /// The relay itself (welcome and keep-alive replies).
    Relay,
    /// An agent name outside the documented set.
    #[serde(untagged)]
    Other(String),
}

impl AgentKind {
    /// Wire name of this agent kind.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Cursor => "cursor",
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::Unknown => "unknown",
            Self::Relay => "relay",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_uses_snake_case_names() {
        let json = serde_json::to_string(&MessageType::LogicCollision).unwrap();
        assert_eq!(json, "\"logic_collision\"");
        let parsed: MessageType = serde_json::from_str("\"vibe_alert\"").unwrap();
        assert_eq!(parsed, MessageType::VibeAlert);
    }

    #[test]
    fn unrecognised_message_type_is_preserved() {
        let parsed: MessageType = serde_json::from_str("\"file_lock\"").unwrap();
        assert_eq!(parsed, MessageType::Other("file_lock".to_string()));
        assert!(!parsed.is_known());
        assert_eq!(serde_json::to_string(&parsed).unwrap(), "\"file_lock\"");
    }

    #[test]
    fn agent_kind_round_trips_unknown_names() {
        let parsed: AgentKind = serde_json::from_str("\"copilot\"").unwrap();
        assert_eq!(parsed.as_str(), "copilot");
        let parsed: AgentKind = serde_json::from_str("\"claude\"").unwrap();
        assert_eq!(parsed, AgentKind::Claude);
    }

    #[test]
    fn display_matches_wire_name() {
        assert_eq!(MessageType::StateUpdate.to_string(), "state_update");
        assert_eq!(AgentKind::Relay.to_string(), "relay");
    }
}
