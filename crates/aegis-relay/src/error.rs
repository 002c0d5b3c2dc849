use std::net::SocketAddr;
use thiserror::Error;

/// Errors that can occur during relay operation.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration failed validation.
    #[error("configuration error: {0}")]
    Config(String),
    /// The listening socket could not be bound. Fatal to the relay instance.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: SocketAddr,
        /// Underlying I/O failure (address in use, permission denied, ...).
        #[source]
        source: std::io::Error,
    },
    /// Another live connection already holds this identity and the policy is `reject`.
    #[error("identity already connected: {0}")]
    DuplicateIdentity(String),
    /// The peer did not accept a frame in time; it has stopped reading.
    #[error("write timed out after {0:?}")]
    WriteTimeout(std::time::Duration),
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The connection was closed by the remote peer or by the relay.
    #[error("connection closed")]
    ConnectionClosed,
}
