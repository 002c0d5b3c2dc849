//! Envelope fanout.
//!
//! Delivery is at-most-once and best effort: every registered client except
//! the excluded identity gets one copy queued without waiting. Clients whose
//! queue is gone are purged; clients whose queue is full lose that copy and,
//! after enough losses, their connection.

use crate::config::UnknownTypePolicy;
use crate::metrics::{counters, histograms};
use crate::ratelimit::InboundLimiter;
use crate::registry::{ClientHandle, Outbound};
use crate::server::RelayState;
use aegis_common::{Envelope, MessageType};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Outcome of one [`broadcast`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Copies queued.
    pub delivered: usize,
    /// Recipients skipped because their connection had already gone away.
    pub skipped: usize,
    /// Copies lost to a full recipient queue.
    pub dropped: usize,
}

/// What the connection task should do after an inbound text frame.
#[derive(Debug)]
pub enum Inbound {
    /// The envelope was fanned out.
    Relayed(BroadcastReport),
    /// Write this text back to the sender only.
    Reply(String),
    /// Nothing was sent; the label says why.
    Dropped(&'static str),
}

/// Fan `envelope` out to every registered client except `exclude`.
///
/// The envelope is serialized once; all recipients share the same text.
pub fn broadcast(state: &RelayState, envelope: &Envelope, exclude: Option<&str>) -> BroadcastReport {
    let text = match envelope.to_json() {
        Ok(text) => Arc::new(text),
        Err(e) => {
            warn!(kind = %envelope.kind, error = %e, "failed to serialize envelope");
            counters::messages_dropped_total("serialize");
            return BroadcastReport::default();
        }
    };
    fanout(state, &text, exclude)
}

fn fanout(state: &RelayState, text: &Outbound, exclude: Option<&str>) -> BroadcastReport {
    let start = Instant::now();
    let mut report = BroadcastReport::default();

    for client in state.registry.snapshot() {
        if exclude == Some(client.identity.as_str()) {
            continue;
        }
        if !client.is_open() {
            report.skipped += 1;
            state.registry.unregister_if(&client.identity, client.conn_id);
            continue;
        }
        match client.try_send(Arc::clone(text)) {
            Ok(()) => report.delivered += 1,
            Err(TrySendError::Full(_)) => {
                report.dropped += 1;
                on_queue_full(state, &client);
            }
            Err(TrySendError::Closed(_)) => {
                report.skipped += 1;
                state.registry.unregister_if(&client.identity, client.conn_id);
            }
        }
    }

    counters::messages_relayed_total(report.delivered as u64);
    state.stats.delivered(report.delivered as u64);
    histograms::fanout_seconds(start.elapsed().as_secs_f64());
    report
}

fn on_queue_full(state: &RelayState, client: &ClientHandle) {
    counters::messages_dropped_total("queue_full");
    state.stats.queue_full();
    let drops = client.record_drop();

    let limit = state.config.slow_client_drop_limit;
    if limit > 0 && drops >= limit {
        warn!(identity = %client.identity, drops, "disconnecting slow client");
        counters::slow_clients_evicted_total();
        state.stats.slow_client_evicted();
        state.registry.unregister_if(&client.identity, client.conn_id);
        client.request_close();
    } else {
        debug!(identity = %client.identity, drops, "client queue full, dropped message");
    }
}

/// Count an inbound message the relay refused to forward.
pub fn record_rejected(state: &RelayState, sender: &str, reason: &'static str) {
    debug!(identity = sender, reason, "dropping inbound message");
    counters::messages_dropped_total(reason);
    state.stats.malformed();
}

/// Validate one inbound text frame from `sender` and act on it.
///
/// A valid envelope is relayed exactly as received. Malformed frames are dropped silently as far as the sender is concerned;
/// the connection stays open.
pub fn handle_inbound(
    state: &RelayState,
    sender: &str,
    text: &str,
    limiter: &mut InboundLimiter,
) -> Inbound {
    if let Err(throttle) = limiter.admit(Instant::now(), text.len()) {
        debug!(identity = sender, reason = throttle.reason(), "inbound rate limit hit");
        counters::messages_dropped_total("rate_limit");
        state.stats.rate_limited();
        return Inbound::Dropped("rate_limit");
    }

    let parsed = match state.config.unknown_types {
        UnknownTypePolicy::Relay => Envelope::parse(text),
        UnknownTypePolicy::Drop => Envelope::parse_strict(text),
    };
    let envelope = match parsed {
        Ok(envelope) => envelope,
        Err(e) => {
            let reason = e.reason();
            record_rejected(state, sender, reason);
            return Inbound::Dropped(reason);
        }
    };
    state.stats.envelope_received();

    if envelope.kind == MessageType::Ping {
        return match Envelope::pong(envelope.payload).to_json() {
            Ok(reply) => Inbound::Reply(reply),
            Err(_) => Inbound::Dropped("serialize"),
        };
    }

    // Forward the sender's own text so key order and extra fields survive.
    Inbound::Relayed(fanout(state, &Arc::new(text.to_owned()), Some(sender)))
}
