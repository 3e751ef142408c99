//! Prometheus metrics collection and HTTP endpoint.

use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness check response.
#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

/// Shared readiness state.
#[derive(Clone, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    /// Create a new health state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Mark the service as ready.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Check if the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

/// # Errors
///
/// Returns an error if binding the metrics HTTP server fails.
pub async fn start_metrics_server(
    addr: SocketAddr,
    health_state: HealthState,
) -> anyhow::Result<()> {
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
        .route("/ready", get(move || ready_handler(health_state.clone())));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Health check handler - returns 200 if server is running.
async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

/// Readiness check handler - returns 200 if ready, 503 if not.
async fn ready_handler(state: HealthState) -> (StatusCode, Json<ReadyResponse>) {
    if state.is_ready() {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "not ready",
                ready: false,
            }),
        )
    }
}

/// Peer and task gauges.
pub mod gauges {
    /// Increment the connected-peers gauge.
    pub fn inc_peers_active() {
        metrics::gauge!("trellis_peers_active").increment(1.0);
    }

    /// Decrement the connected-peers gauge.
    pub fn dec_peers_active() {
        metrics::gauge!("trellis_peers_active").decrement(1.0);
    }

    /// Set the in-flight dial task gauge.
    pub fn dial_tasks_running(value: usize) {
        metrics::gauge!("trellis_dial_tasks_running").set(value as f64);
    }
}

/// Event counters.
pub mod counters {
    /// Record an admission decision with the given gate and outcome.
    pub fn admissions_total(gate: &'static str, outcome: &'static str) {
        metrics::counter!("trellis_admissions_total", "gate" => gate, "outcome" => outcome)
            .increment(1);
    }

    /// Record an accepted inbound socket.
    pub fn accepts_total() {
        metrics::counter!("trellis_accepts_total").increment(1);
    }

    /// Record an inbound socket dropped by the allow/deny lists.
    pub fn rejected_addresses_total(reason: &'static str) {
        metrics::counter!("trellis_rejected_addresses_total", "reason" => reason).increment(1);
    }

    /// Record a completed dial attempt.
    pub fn dials_total(outcome: &'static str) {
        metrics::counter!("trellis_dials_total", "outcome" => outcome).increment(1);
    }

    /// Record socket bytes in the given direction.
    pub fn net_bytes_total(direction: &'static str, inbound_conn: bool, bytes: u64) {
        let provenance = if inbound_conn { "inbound" } else { "outbound" };
        metrics::counter!(
            "trellis_net_bytes_total",
            "direction" => direction,
            "provenance" => provenance
        )
        .increment(bytes);
    }
}
