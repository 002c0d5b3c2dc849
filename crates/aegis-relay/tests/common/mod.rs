#![allow(dead_code)]

use aegis_common::types::IDENTITY_HEADER;
use aegis_common::{AgentKind, Envelope, MessageType};
use aegis_relay::{Relay, RelayConfig};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

type ClientStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);
pub const FLOOD_TIMEOUT: Duration = Duration::from_secs(15);

pub async fn start_relay() -> Relay {
    start_relay_with(RelayConfig::ephemeral()).await
}

pub async fn start_relay_with(config: RelayConfig) -> Relay {
    Relay::start(config).await.unwrap()
}

/// Poll until `check` holds or the timeout elapses.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(RECV_TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Broadcast `chunk_size`-byte state updates until `done` holds.
///
/// Used to push data at clients that have stopped reading.
pub async fn flood_until(relay: &Relay, chunk_size: usize, mut done: impl FnMut(&Relay) -> bool) {
    let chunk = serde_json::Value::String("x".repeat(chunk_size));
    tokio::time::timeout(FLOOD_TIMEOUT, async {
        while !done(relay) {
            relay.broadcast_state_update(chunk.clone());
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached while flooding");
}

pub struct TestClient {
    pub ws_tx: futures_util::stream::SplitSink<ClientStream, Message>,
    pub ws_rx: futures_util::stream::SplitStream<ClientStream>,
    /// Identity the relay confirmed in its welcome.
    pub identity: String,
}

/// What a client observed when waiting for the next frame.
#[derive(Debug)]
pub enum Received {
    Envelope(Envelope),
    Closed(Option<CloseFrame<'static>>),
}

impl TestClient {
    /// Connect without an identity header and consume the welcome.
    pub async fn connect(addr: SocketAddr) -> Self {
        Self::connect_inner(addr, None).await
    }

    /// Connect announcing `identity` and consume the welcome.
    pub async fn connect_as(addr: SocketAddr, identity: &str) -> Self {
        Self::connect_inner(addr, Some(identity)).await
    }

    async fn connect_inner(addr: SocketAddr, identity: Option<&str>) -> Self {
        let (ws_tx, ws_rx) = raw_connect(addr, identity).await;
        let mut client = Self {
            ws_tx,
            ws_rx,
            identity: String::new(),
        };

        let welcome = client.recv_envelope().await;
        assert_eq!(welcome.kind, MessageType::StateUpdate);
        assert_eq!(welcome.agent, AgentKind::Relay);
        client.identity = welcome.payload["client_id"]
            .as_str()
            .expect("welcome should carry client_id")
            .to_string();
        client
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws_tx
            .send(Message::Text(text.to_string()))
            .await
            .unwrap();
    }

    pub async fn send_envelope(&mut self, envelope: &Envelope) {
        let text = envelope.to_json().unwrap();
        self.send_text(&text).await;
    }

    /// Next text frame, raw. Panics on timeout or close.
    pub async fn recv_text(&mut self) -> String {
        match self.recv_raw(RECV_TIMEOUT).await {
            Some(Ok(text)) => text,
            Some(Err(close)) => panic!("connection closed while waiting: {close:?}"),
            None => panic!("timeout waiting for text frame"),
        }
    }

    pub async fn recv_envelope(&mut self) -> Envelope {
        let text = self.recv_text().await;
        Envelope::parse(&text).unwrap()
    }

    /// Next envelope or close within `timeout`; `None` if nothing arrived.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Received> {
        match self.recv_raw(timeout).await? {
            Ok(text) => Some(Received::Envelope(Envelope::parse(&text).unwrap())),
            Err(close) => Some(Received::Closed(close)),
        }
    }

    /// Assert nothing but keep-alive traffic arrives within `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        if let Some(Ok(text)) = self.recv_raw(window).await {
            panic!("expected no message, got {text}");
        }
    }

    /// Wait for the relay to close this connection, returning its close frame.
    pub async fn expect_closed(&mut self) -> Option<CloseFrame<'static>> {
        match self.recv_raw(RECV_TIMEOUT).await {
            Some(Err(close)) => close,
            Some(Ok(text)) => panic!("expected close, got {text}"),
            None => panic!("timeout waiting for close"),
        }
    }

    async fn recv_raw(
        &mut self,
        timeout: Duration,
    ) -> Option<Result<String, Option<CloseFrame<'static>>>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let next = tokio::time::timeout_at(deadline, self.ws_rx.next()).await.ok()?;
            match next {
                Some(Ok(Message::Text(text))) => return Some(Ok(text)),
                Some(Ok(Message::Close(frame))) => return Some(Err(frame)),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(other)) => panic!("unexpected frame: {other:?}"),
                Some(Err(_)) | None => return Some(Err(None)),
            }
        }
    }
}

/// Connect and return both halves without reading anything.
pub async fn raw_connect(
    addr: SocketAddr,
    identity: Option<&str>,
) -> (
    futures_util::stream::SplitSink<ClientStream, Message>,
    futures_util::stream::SplitStream<ClientStream>,
) {
    let mut req = format!("ws://{addr}").into_client_request().unwrap();
    if let Some(identity) = identity {
        req.headers_mut()
            .insert(IDENTITY_HEADER, identity.parse().unwrap());
    }
    let (ws, _) = tokio_tungstenite::connect_async(req).await.unwrap();
    ws.split()
}
