use aegis_common::types::DEFAULT_PORT;
use clap::{Parser, ValueEnum};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// What to do when a client connects under an identity that is already registered.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateIdentityPolicy {
    /// Last-registered wins; the earlier connection is closed.
    #[default]
    Replace,
    /// Refuse the newcomer with a policy-violation close frame.
    Reject,
}

/// What to do with envelopes whose `type` is outside the documented set.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownTypePolicy {
    /// Fan them out like any other envelope.
    #[default]
    Relay,
    /// Drop them as if malformed.
    Drop,
}

/// CLI arguments for the relay.
#[derive(Parser, Debug, Clone)]
#[command(name = "aegis-relay")]
#[command(about = "Local WebSocket relay for editor-integrated agents")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, default_value_t = default_listen(), env = "AEGIS_RELAY_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the health/metrics endpoint. Disabled when unset.
    #[arg(long, env = "AEGIS_RELAY_METRICS")]
    pub metrics_addr: Option<SocketAddr>,
    /// Maximum concurrent clients.
    #[arg(long, default_value = "1024", env = "AEGIS_RELAY_MAX_CLIENTS")]
    pub max_clients: usize,
    /// Outbound queue depth per client, in messages.
    #[arg(long, default_value = "256", env = "AEGIS_RELAY_SEND_QUEUE")]
    pub send_queue: usize,
    /// Dropped messages after which a slow client is disconnected. 0 = never.
    #[arg(long, default_value = "100", env = "AEGIS_RELAY_SLOW_DROPS")]
    pub slow_client_drop_limit: u64,
    /// Maximum inbound WebSocket message size in bytes.
    #[arg(long, default_value = "1048576", env = "AEGIS_RELAY_MAX_MESSAGE")]
    pub max_message_size: usize,
    /// Maximum inbound envelopes per minute per client.
    #[arg(long, default_value = "600", env = "AEGIS_RELAY_MSG_RATE")]
    pub msg_rate: u32,
    /// Maximum inbound bytes per minute per client.
    #[arg(long, default_value = "16777216", env = "AEGIS_RELAY_BW_RATE")]
    pub bw_rate: u64,
    /// Handling of a second connection under an identity already in use.
    #[arg(long, value_enum, default_value_t, env = "AEGIS_RELAY_DUPLICATE_IDENTITY")]
    pub duplicate_identity: DuplicateIdentityPolicy,
    /// Handling of envelopes with an undocumented `type`.
    #[arg(long, value_enum, default_value_t, env = "AEGIS_RELAY_UNKNOWN_TYPES")]
    pub unknown_types: UnknownTypePolicy,
    /// Seconds to wait for connections to close on shutdown.
    #[arg(long, default_value = "5", env = "AEGIS_RELAY_DRAIN_TIMEOUT")]
    pub drain_timeout: u64,
    /// Seconds a single frame write may block before the client is dropped.
    #[arg(long, default_value = "10", env = "AEGIS_RELAY_WRITE_TIMEOUT")]
    pub write_timeout: u64,
    /// Increase log verbosity (repeat for more detail). Ignored when RUST_LOG is set.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT))
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Socket address for the health/metrics endpoint.
    pub metrics_addr: Option<SocketAddr>,
    /// Maximum concurrent clients.
    pub max_clients: usize,
    /// Outbound queue depth per client.
    pub send_queue: usize,
    /// Drops tolerated before a slow client is disconnected. 0 = never.
    pub slow_client_drop_limit: u64,
    /// Maximum inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Maximum inbound envelopes per minute per client.
    pub msg_rate: u32,
    /// Maximum inbound bytes per minute per client.
    pub bw_rate: u64,
    /// Duplicate identity handling.
    pub duplicate_identity: DuplicateIdentityPolicy,
    /// Unknown envelope type handling.
    pub unknown_types: UnknownTypePolicy,
    /// Seconds to wait for connections to close on shutdown.
    pub drain_timeout: u64,
    /// Seconds a single frame write may block before the client is dropped.
    pub write_timeout: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            metrics_addr: None,
            max_clients: 1024,
            send_queue: 256,
            slow_client_drop_limit: 100,
            max_message_size: 1_048_576,
            msg_rate: 600,
            bw_rate: 16 * 1_048_576,
            duplicate_identity: DuplicateIdentityPolicy::Replace,
            unknown_types: UnknownTypePolicy::Relay,
            drain_timeout: 5,
            write_timeout: 10,
        }
    }
}

impl RelayConfig {
    /// Default configuration listening on an ephemeral localhost port.
    #[must_use]
    pub fn ephemeral() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            ..Self::default()
        }
    }

    /// Shutdown drain window.
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout)
    }

    /// Per-frame socket write limit.
    #[must_use]
    pub const fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout)
    }

    /// Check every value against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first offending field.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_clients == 0 {
            return Err("max_clients must be greater than 0".to_string());
        }
        if self.max_clients > 100_000 {
            return Err("max_clients exceeds reasonable limit (100,000)".to_string());
        }

        if self.send_queue == 0 {
            return Err("send_queue must be greater than 0".to_string());
        }
        if self.send_queue > 65_536 {
            return Err("send_queue exceeds reasonable limit (65,536 messages)".to_string());
        }

        if self.max_message_size < 64 {
            return Err("max_message_size must be at least 64 bytes".to_string());
        }
        if self.max_message_size > 64 * 1_048_576 {
            return Err("max_message_size exceeds reasonable limit (64 MiB)".to_string());
        }

        if self.msg_rate == 0 {
            return Err("msg_rate must be greater than 0".to_string());
        }
        if self.bw_rate < self.max_message_size as u64 {
            return Err("bw_rate must allow at least one max_message_size message".to_string());
        }

        if self.drain_timeout > 300 {
            return Err("drain_timeout exceeds reasonable limit (300 seconds)".to_string());
        }
        if self.write_timeout == 0 || self.write_timeout > 300 {
            return Err("write_timeout must be between 1 and 300 seconds".to_string());
        }

        if self.metrics_addr.is_some_and(|addr| addr == self.listen && addr.port() != 0) {
            return Err("metrics_addr must differ from listen".to_string());
        }
        Ok(())
    }
}

impl From<Args> for RelayConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            metrics_addr: args.metrics_addr,
            max_clients: args.max_clients,
            send_queue: args.send_queue,
            slow_client_drop_limit: args.slow_client_drop_limit,
            max_message_size: args.max_message_size,
            msg_rate: args.msg_rate,
            bw_rate: args.bw_rate,
            duplicate_identity: args.duplicate_identity,
            unknown_types: args.unknown_types,
            drain_timeout: args.drain_timeout,
            write_timeout: args.write_timeout,
        }
    }
}
