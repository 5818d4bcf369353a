//! Prometheus /metrics + health check HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics  Prometheus text format
//!   GET /healthz  liveness probe (always 200 if the process is running)
//!   GET /readyz   readiness probe (200 if the object store is reachable)

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use std::sync::Arc;

type Labels = Vec<(String, String)>;

/// Counters shared by the pipeline and the streaming service.
#[derive(Clone, Default)]
pub struct ServiceMetrics {
    containers_sealed: Counter,
    seal_failures: Counter,
    clips_detected: Counter,
    stream_requests: Family<Labels, Counter>,
    decrypt_failures: Counter,
}

impl ServiceMetrics {
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "evcam_containers_sealed",
            "Containers sealed and stored",
            metrics.containers_sealed.clone(),
        );
        registry.register(
            "evcam_seal_failures",
            "Seal attempts that failed and will be retried",
            metrics.seal_failures.clone(),
        );
        registry.register(
            "evcam_clips_detected",
            "Raw clips passed through plate detection",
            metrics.clips_detected.clone(),
        );
        registry.register(
            "evcam_stream_requests",
            "Footage requests by kind and outcome",
            metrics.stream_requests.clone(),
        );
        registry.register(
            "evcam_decrypt_failures",
            "Stored objects that could not be decrypted",
            metrics.decrypt_failures.clone(),
        );
        metrics
    }

    pub fn sealed(&self) {
        self.containers_sealed.inc();
    }

    pub fn seal_failed(&self) {
        self.seal_failures.inc();
    }

    pub fn detected(&self) {
        self.clips_detected.inc();
    }

    pub fn stream(&self, kind: &str, outcome: &str) {
        self.stream_requests
            .get_or_create(&vec![
                ("kind".to_string(), kind.to_string()),
                ("outcome".to_string(), outcome.to_string()),
            ])
            .inc();
    }

    pub fn decrypt_failed(&self) {
        self.decrypt_failures.inc();
    }
}

/// Shared state for the probe and metrics handlers
#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<Registry>,
    pub operator: opendal::Operator,
}

/// Probe and metrics routes, mergeable into any router.
pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state)
}

/// Serve metrics and probes on a dedicated listener (e.g. "127.0.0.1:9100")
pub async fn serve(addr: String, state: HealthState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("metrics bind {addr}: {e}"))?;

    tracing::info!(addr = %addr, "metrics: listening on /metrics, /healthz, /readyz");

    axum::serve(listener, router(state))
        .await
        .map_err(|e| anyhow::anyhow!("metrics server: {e}"))
}

async fn metrics_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let mut body = String::new();
    match encode(&mut body, &state.registry) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz_handler(State(state): State<HealthState>) -> impl IntoResponse {
    if evcam_storage::is_healthy(&state.operator).await {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "storage unreachable")
    }
}
