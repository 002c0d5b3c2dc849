use std::sync::atomic::{AtomicU64, Ordering};

/// In-process counters mirroring the exported metrics.
///
/// The `metrics` facade is write-only from the relay's side; these let the
/// owning process (and tests) read what happened without a recorder.
#[derive(Debug, Default)]
pub struct RelayStats {
    connections_accepted: AtomicU64,
    connections_refused: AtomicU64,
    envelopes_received: AtomicU64,
    deliveries: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_rate_limited: AtomicU64,
    dropped_queue_full: AtomicU64,
    slow_clients_evicted: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Connections that completed the WebSocket handshake and registered.
    pub connections_accepted: u64,
    /// Connections refused for capacity or duplicate identity.
    pub connections_refused: u64,
    /// Well-formed envelopes received from clients.
    pub envelopes_received: u64,
    /// Envelope copies queued to recipients.
    pub deliveries: u64,
    /// Inbound messages dropped as malformed, binary or of a refused type.
    pub dropped_malformed: u64,
    /// Inbound envelopes dropped by the per-connection rate limit.
    pub dropped_rate_limited: u64,
    /// Outbound copies dropped because a recipient's queue was full.
    pub dropped_queue_full: u64,
    /// Clients disconnected for falling too far behind.
    pub slow_clients_evicted: u64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl RelayStats {
    pub(crate) fn connection_accepted(&self) {
        bump(&self.connections_accepted, 1);
    }

    pub(crate) fn connection_refused(&self) {
        bump(&self.connections_refused, 1);
    }

    pub(crate) fn envelope_received(&self) {
        bump(&self.envelopes_received, 1);
    }

    pub(crate) fn delivered(&self, copies: u64) {
        bump(&self.deliveries, copies);
    }

    pub(crate) fn malformed(&self) {
        bump(&self.dropped_malformed, 1);
    }

    pub(crate) fn rate_limited(&self) {
        bump(&self.dropped_rate_limited, 1);
    }

    pub(crate) fn queue_full(&self) {
        bump(&self.dropped_queue_full, 1);
    }

    pub(crate) fn slow_client_evicted(&self) {
        bump(&self.slow_clients_evicted, 1);
    }

    /// Read every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            connections_accepted: load(&self.connections_accepted),
            connections_refused: load(&self.connections_refused),
            envelopes_received: load(&self.envelopes_received),
            deliveries: load(&self.deliveries),
            dropped_malformed: load(&self.dropped_malformed),
            dropped_rate_limited: load(&self.dropped_rate_limited),
            dropped_queue_full: load(&self.dropped_queue_full),
            slow_clients_evicted: load(&self.slow_clients_evicted),
        }
    }
}
