use crate::config::RelayConfig;
use crate::connection::handle_connection;
use crate::error::RelayError;
use crate::metrics::counters;
use crate::registry::Registry;
use crate::stats::RelayStats;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Shared state for one relay instance.
pub struct RelayState {
    /// Runtime relay configuration.
    pub config: RelayConfig,
    /// Identity → connection table.
    pub registry: Registry,
    /// Readable counters.
    pub stats: RelayStats,
    /// Connection tasks currently running, registered or not.
    active_connections: AtomicUsize,
    next_conn_id: AtomicU64,
    closing: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl RelayState {
    /// Fresh state with an empty registry.
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            registry: Registry::new(),
            stats: RelayStats::default(),
            active_connections: AtomicUsize::new(0),
            next_conn_id: AtomicU64::new(1),
            closing: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Allocate an id for a new connection.
    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Connection tasks currently running.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Mark the relay as closing and wake every task. Returns `false` if it
    /// was already closing.
    pub fn begin_close(&self) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shutdown.send_replace(true);
        true
    }

    /// `true` once [`RelayState::begin_close`] has run.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Receiver that flips to `true` when the relay starts closing.
    #[must_use]
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

/// Decrements the running-connection count when a connection task ends.
struct ActiveGuard {
    state: Arc<RelayState>,
}

impl ActiveGuard {
    fn new(state: Arc<RelayState>) -> Self {
        state.active_connections.fetch_add(1, Ordering::Relaxed);
        Self { state }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.state.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Run the accept loop until [`RelayState::begin_close`] is called, then wait
/// up to the configured drain timeout for connection tasks to finish.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run(listener: TcpListener, state: Arc<RelayState>) -> Result<(), RelayError> {
    let local_addr = listener.local_addr()?;
    info!("relay listening on {}", local_addr);
    let mut shutdown_rx = state.subscribe_shutdown();
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        if state.active_connections() >= state.config.max_clients {
                            warn!("max clients reached, rejecting {}", addr);
                            counters::connections_refused_total("max_clients");
                            state.stats.connection_refused();
                            drop(stream);
                            continue;
                        }
                        let guard = ActiveGuard::new(Arc::clone(&state));
                        let state = Arc::clone(&state);
                        tasks.spawn(async move {
                            let _guard = guard;
                            if let Err(e) = handle_connection(stream, addr, state).await {
                                debug!("connection from {} closed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            () = async { let _ = shutdown_rx.wait_for(|closing| *closing).await; } => {
                info!("shutdown requested, draining {} connections", tasks.len());
                break;
            }
        }
    }
    drop(listener);

    let drain = state.config.drain_timeout();
    let drained = tokio::time::timeout(drain, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "drain timeout reached with {} connections still active, aborting",
            tasks.len()
        );
        tasks.shutdown().await;
    }

    info!("relay on {} shut down", local_addr);
    Ok(())
}
