use crate::server::RelayState;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    connected: usize,
}

/// Readiness check response.
#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

/// Serve `/health`, `/ready` and `/metrics` for external probes.
///
/// # Errors
///
/// Returns an error if the Prometheus recorder is already installed or
/// binding the HTTP listener fails.
pub async fn start_metrics_server(addr: SocketAddr, state: Arc<RelayState>) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Returns 200 with the live client count while the process runs.
async fn health_handler(State(state): State<Arc<RelayState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        connected: state.registry.count(),
    })
}

/// Returns 200 while accepting, 503 once the relay is closing.
async fn ready_handler(State(state): State<Arc<RelayState>>) -> (StatusCode, Json<ReadyResponse>) {
    if state.is_closing() {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "closing",
                ready: false,
            }),
        )
    } else {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    }
}

/// Connection count gauges.
pub mod gauges {
    /// Increment the active connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("aegis_connections_active").increment(1.0);
    }

    /// Decrement the active connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("aegis_connections_active").decrement(1.0);
    }
}

/// Event counters.
pub mod counters {
    /// Count one envelope queued for one recipient.
    pub fn messages_relayed_total(recipients: u64) {
        metrics::counter!("aegis_messages_relayed_total").increment(recipients);
    }

    /// Increment the dropped-messages counter with the given reason label.
    pub fn messages_dropped_total(reason: &'static str) {
        metrics::counter!("aegis_messages_dropped_total", "reason" => reason).increment(1);
    }

    /// Count a client disconnected for falling behind.
    pub fn slow_clients_evicted_total() {
        metrics::counter!("aegis_slow_clients_evicted_total").increment(1);
    }

    /// Count a connection refused at accept or registration.
    pub fn connections_refused_total(reason: &'static str) {
        metrics::counter!("aegis_connections_refused_total", "reason" => reason).increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record how long one fanout took, in seconds.
    pub fn fanout_seconds(value: f64) {
        metrics::histogram!("aegis_fanout_seconds").record(value);
    }
}
