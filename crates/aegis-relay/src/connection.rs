use crate::broker::{self, Inbound};
use crate::error::RelayError;
use crate::metrics::{counters, gauges};
use crate::ratelimit::InboundLimiter;
use crate::registry::{ClientHandle, Outbound};
use crate::server::RelayState;
use aegis_common::types::{GENERATED_IDENTITY_PREFIX, IDENTITY_HEADER};
use aegis_common::Envelope;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::rngs::OsRng;
use rand::RngCore;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::http::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

/// Longest identity accepted from the header; longer ones get a generated id.
const MAX_IDENTITY_LEN: usize = 128;

/// Read the self-declared identity from the upgrade request, if usable.
fn extract_identity(request: &Request<()>) -> Option<String> {
    let value = request.headers().get(IDENTITY_HEADER)?.to_str().ok()?.trim();
    if value.is_empty() || value.len() > MAX_IDENTITY_LEN {
        return None;
    }
    Some(value.to_string())
}

/// `client_<unix-millis>_<random>`; unique enough that two anonymous clients
/// never share a registry slot.
fn generate_identity() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("{GENERATED_IDENTITY_PREFIX}{millis}_{:08x}", OsRng.next_u32())
}

/// Write one frame, giving up if the peer has not accepted it within `limit`.
async fn write_frame(ws_tx: &mut WsSink, msg: Message, limit: Duration) -> Result<(), RelayError> {
    match tokio::time::timeout(limit, ws_tx.send(msg)).await {
        Ok(sent) => Ok(sent?),
        Err(_) => Err(RelayError::WriteTimeout(limit)),
    }
}

async fn send_close(ws_tx: &mut WsSink, code: CloseCode, reason: &'static str, limit: Duration) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = write_frame(ws_tx, Message::Close(Some(frame)), limit).await {
        debug!("failed to send close frame: {}", e);
    }
}

/// Drive one registered connection until it closes.
async fn run_message_loop(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    deliver_rx: &mut mpsc::Receiver<Outbound>,
    state: &RelayState,
    handle: &ClientHandle,
) -> Result<(), RelayError> {
    let mut limiter = InboundLimiter::new(state.config.msg_rate, state.config.bw_rate);
    let mut shutdown_rx = state.subscribe_shutdown();
    let limit = state.config.write_timeout();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Inbound::Reply(reply) =
                            broker::handle_inbound(state, &handle.identity, &text, &mut limiter)
                        {
                            write_frame(ws_tx, Message::Text(reply), limit).await?;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        broker::record_rejected(state, &handle.identity, "binary");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write_frame(ws_tx, Message::Pong(data), limit).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(RelayError::WebSocket(e)),
                    Some(Ok(_)) => {}
                }
            }
            Some(text) = deliver_rx.recv() => {
                // An evicted client may have stopped reading; don't wait on its socket.
                tokio::select! {
                    sent = write_frame(ws_tx, Message::Text(text.as_ref().clone()), limit) => sent?,
                    () = handle.close_requested() => {
                        debug!(identity = %handle.identity, "dropping connection mid-write on relay request");
                        return Ok(());
                    }
                }
            }
            () = handle.close_requested() => {
                debug!(identity = %handle.identity, "closing on relay request");
                send_close(ws_tx, CloseCode::Policy, "superseded or too slow", limit).await;
                return Ok(());
            }
            () = async { let _ = shutdown_rx.wait_for(|closing| *closing).await; } => {
                send_close(ws_tx, CloseCode::Away, "relay shutting down", limit).await;
                return Ok(());
            }
        }
    }
}

/// Send the welcome envelope, then relay until the connection ends.
async fn greet_and_relay(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    deliver_rx: &mut mpsc::Receiver<Outbound>,
    state: &RelayState,
    handle: &ClientHandle,
) -> Result<(), RelayError> {
    let welcome = Envelope::welcome(&handle.identity)
        .to_json()
        .map_err(|_| RelayError::ConnectionClosed)?;
    write_frame(ws_tx, Message::Text(welcome), state.config.write_timeout()).await?;
    run_message_loop(ws_tx, ws_rx, deliver_rx, state, handle).await
}

/// Handshake, register, greet, relay, unregister.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<RelayState>,
) -> Result<(), RelayError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(state.config.max_message_size),
        max_frame_size: Some(state.config.max_message_size),
        ..WebSocketConfig::default()
    };

    let claimed = Arc::new(OnceLock::new());
    let claimed_cell = claimed.clone();
    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        move |req: &Request<()>, resp: Response<()>| {
            if let Some(identity) = extract_identity(req) {
                let _ = claimed_cell.set(identity);
            }
            Ok(resp)
        },
        Some(ws_config),
    )
    .await?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    if state.is_closing() {
        send_close(&mut ws_tx, CloseCode::Away, "relay shutting down", state.config.write_timeout()).await;
        return Err(RelayError::ConnectionClosed);
    }

    let identity = claimed.get().cloned().unwrap_or_else(generate_identity);
    let (deliver_tx, mut deliver_rx) = mpsc::channel::<Outbound>(state.config.send_queue);
    let handle = ClientHandle::new(identity, state.next_conn_id(), deliver_tx);

    match state
        .registry
        .register(handle.clone(), state.config.duplicate_identity)
    {
        Ok(Some(previous)) => {
            debug!(identity = %handle.identity, "identity re-registered, closing previous connection");
            previous.request_close();
        }
        Ok(None) => {}
        Err(e) => {
            debug!(identity = %handle.identity, "refusing duplicate identity");
            counters::connections_refused_total("duplicate_identity");
            state.stats.connection_refused();
            send_close(
                &mut ws_tx,
                CloseCode::Policy,
                "identity already connected",
                state.config.write_timeout(),
            )
            .await;
            return Err(e);
        }
    }

    gauges::inc_connections_active();
    state.stats.connection_accepted();
    info!(identity = %handle.identity, peer = %peer_addr, "client connected");

    let result = greet_and_relay(&mut ws_tx, &mut ws_rx, &mut deliver_rx, &state, &handle).await;

    state.registry.unregister_if(&handle.identity, handle.conn_id);
    gauges::dec_connections_active();
    info!(identity = %handle.identity, "client disconnected");

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_identity_from_header() {
        let req = Request::builder()
            .header(IDENTITY_HEADER, "claude")
            .body(())
            .unwrap();
        assert_eq!(extract_identity(&req).as_deref(), Some("claude"));
    }

    #[test]
    fn extract_identity_trims_whitespace() {
        let req = Request::builder()
            .header(IDENTITY_HEADER, "  cursor ")
            .body(())
            .unwrap();
        assert_eq!(extract_identity(&req).as_deref(), Some("cursor"));
    }

    #[test]
    fn missing_or_blank_identity_is_none() {
        let req = Request::builder().body(()).unwrap();
        assert!(extract_identity(&req).is_none());

        let req = Request::builder()
            .header(IDENTITY_HEADER, "   ")
            .body(())
            .unwrap();
        assert!(extract_identity(&req).is_none());
    }

    #[test]
    fn oversized_identity_is_ignored() {
        let long = "x".repeat(MAX_IDENTITY_LEN + 1);
        let req = Request::builder()
            .header(IDENTITY_HEADER, long.as_str())
            .body(())
            .unwrap();
        assert!(extract_identity(&req).is_none());
    }

    #[test]
    fn connection_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        fn check(stream: TcpStream, peer: SocketAddr, state: Arc<RelayState>) {
            let task = handle_connection(stream, peer, state);
            assert_send(&task);
        }
        let _ = check;
    }

    #[test]
    fn generated_identities_have_prefix_and_differ() {
        let a = generate_identity();
        let b = generate_identity();
        assert!(a.starts_with(GENERATED_IDENTITY_PREFIX));
        assert!(b.starts_with(GENERATED_IDENTITY_PREFIX));
        assert_ne!(a, b);
    }
}
