use crate::broker::{self, BroadcastReport};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::server::{self, RelayState};
use crate::stats::StatsSnapshot;
use aegis_common::Envelope;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A running relay instance.
///
/// This is the whole surface other subsystems may rely on: broadcasting,
/// the connected-client count, and shutdown. Each instance owns its own
/// registry, so any number can run side by side.
pub struct Relay {
    state: Arc<RelayState>,
    local_addr: SocketAddr,
    accept_task: Mutex<Option<JoinHandle<Result<(), RelayError>>>>,
}

impl Relay {
    /// Bind `config.listen` and start accepting connections.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] for an invalid configuration and
    /// [`RelayError::Bind`] if the port is taken or not permitted. No retry
    /// is attempted.
    pub async fn start(config: RelayConfig) -> Result<Self, RelayError> {
        config.validate().map_err(RelayError::Config)?;
        let addr = config.listen;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let state = Arc::new(RelayState::new(config));
        let accept_task = tokio::spawn(server::run(listener, Arc::clone(&state)));
        info!(%local_addr, "relay started");

        Ok(Self {
            state,
            local_addr,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    /// Address actually bound (useful when the configured port was 0).
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared state, for the health endpoint.
    #[must_use]
    pub fn state(&self) -> Arc<RelayState> {
        Arc::clone(&self.state)
    }

    /// Fan `envelope` out to every client except `exclude`.
    pub fn broadcast(&self, envelope: &Envelope, exclude: Option<&str>) -> BroadcastReport {
        broker::broadcast(&self.state, envelope, exclude)
    }

    /// Send `state` to every client as a `state_update` from agent `unknown`.
    pub fn broadcast_state_update(&self, state: Value) -> BroadcastReport {
        let report = self.broadcast(&Envelope::state_update(state), None);
        debug!(delivered = report.delivered, "state update broadcast");
        report
    }

    /// Number of registered clients.
    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.state.registry.count()
    }

    /// Relay counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.state.stats.snapshot()
    }

    /// `true` once [`Relay::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.is_closing()
    }

    /// Stop accepting, close every connection and wait for them to finish
    /// (bounded by the configured drain timeout). Calling it again is a no-op.
    pub async fn close(&self) {
        if self.state.begin_close() {
            info!(addr = %self.local_addr, "closing relay");
        }

        let task = self.accept_task.lock().await.take();
        if let Some(task) = task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("accept loop ended with error: {}", e),
                Err(e) => warn!("accept loop task failed: {}", e),
            }
        }

        for leftover in self.state.registry.drain() {
            leftover.request_close();
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.state.begin_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_reports_bound_port() {
        let relay = Relay::start(RelayConfig::ephemeral()).await.unwrap();
        assert_ne!(relay.local_addr().port(), 0);
        assert_eq!(relay.connected_count(), 0);
        relay.close().await;
    }

    #[tokio::test]
    async fn bind_failure_is_returned() {
        let first = Relay::start(RelayConfig::ephemeral()).await.unwrap();
        let mut config = RelayConfig::ephemeral();
        config.listen = first.local_addr();

        let err = Relay::start(config).await.err().unwrap();
        assert!(matches!(err, RelayError::Bind { addr, .. } if addr == first.local_addr()));
        first.close().await;
    }

    #[tokio::test]
    async fn invalid_config_is_refused() {
        let mut config = RelayConfig::ephemeral();
        config.send_queue = 0;
        let err = Relay::start(config).await.err().unwrap();
        assert!(matches!(err, RelayError::Config(ref msg) if msg.contains("send_queue")));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let relay = Relay::start(RelayConfig::ephemeral()).await.unwrap();
        relay.close().await;
        relay.close().await;
        assert!(relay.is_closed());
    }

    #[tokio::test]
    async fn broadcast_with_no_clients_delivers_nothing() {
        let relay = Relay::start(RelayConfig::ephemeral()).await.unwrap();
        let report = relay.broadcast_state_update(serde_json::json!({"status": "idle"}));
        assert_eq!(report, BroadcastReport::default());
        relay.close().await;
    }
}
