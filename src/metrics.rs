//! Prometheus metrics for the git2kv daemon
//!
//! Provides observability metrics for sync cycles, record operations and
//! trigger sources, optionally served over HTTP (`/metrics`, `/health`).

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};
use std::net::SocketAddr;

lazy_static! {
    /// Histogram: sync cycle duration per branch (seconds)
    pub static ref SYNC_DURATION: HistogramVec = register_histogram_vec!(
        "git2kv_sync_duration_seconds",
        "Duration of branch sync cycles",
        &["repo", "branch"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .expect("Failed to create sync_duration metric");

    /// Counter: sync cycles by outcome
    pub static ref SYNC_CYCLES: CounterVec = register_counter_vec!(
        "git2kv_sync_cycles_total",
        "Total sync cycles by status",
        &["status"]
    )
    .expect("Failed to create sync_cycles metric");

    /// Counter: KV records applied by operation
    pub static ref RECORDS_APPLIED: CounterVec = register_counter_vec!(
        "git2kv_records_applied_total",
        "KV records written or deleted",
        &["operation"]
    )
    .expect("Failed to create records_applied metric");

    /// Counter: record operations that failed or timed out
    pub static ref RECORD_FAILURES: CounterVec = register_counter_vec!(
        "git2kv_record_failures_total",
        "Failed record operations per repo",
        &["repo"]
    )
    .expect("Failed to create record_failures metric");

    /// Counter: sync requests merged into a pending cycle
    pub static ref COALESCED_REQUESTS: CounterVec = register_counter_vec!(
        "git2kv_coalesced_requests_total",
        "Sync requests coalesced into the next cycle",
        &["repo", "branch"]
    )
    .expect("Failed to create coalesced_requests metric");

    /// Counter: trigger events by source
    pub static ref TRIGGER_EVENTS: CounterVec = register_counter_vec!(
        "git2kv_trigger_events_total",
        "Trigger events received by source",
        &["source"]
    )
    .expect("Failed to create trigger_events metric");

    /// Gauge: daemon health status (1 = healthy, 0 = unhealthy)
    pub static ref HEALTH_STATUS: Gauge = register_gauge!(
        "git2kv_health_status",
        "Daemon health status (1 = healthy, 0 = unhealthy)"
    )
    .expect("Failed to create health_status metric");
}

/// Record a sync cycle duration
pub fn record_sync_duration(repo: &str, branch: &str, duration_secs: f64) {
    SYNC_DURATION
        .with_label_values(&[repo, branch])
        .observe(duration_secs);
}

/// Record a sync cycle completion (`success`, `noop` or `failure`)
pub fn record_sync_cycle(status: &str) {
    SYNC_CYCLES.with_label_values(&[status]).inc();
}

/// Record applied KV mutations
pub fn record_applied(written: usize, deleted: usize) {
    RECORDS_APPLIED
        .with_label_values(&["write"])
        .inc_by(written as f64);
    RECORDS_APPLIED
        .with_label_values(&["delete"])
        .inc_by(deleted as f64);
}

/// Record failed record operations
pub fn record_failures(repo: &str, count: usize) {
    RECORD_FAILURES
        .with_label_values(&[repo])
        .inc_by(count as f64);
}

/// Record a request merged into the next cycle
pub fn record_coalesced(repo: &str, branch: &str) {
    COALESCED_REQUESTS.with_label_values(&[repo, branch]).inc();
}

/// Record a trigger event (`github`, `stash`, `polling`)
pub fn record_trigger(source: &str) {
    TRIGGER_EVENTS.with_label_values(&[source]).inc();
}

/// Set health status
pub fn set_health_status(healthy: bool) {
    HEALTH_STATUS.set(if healthy { 1.0 } else { 0.0 });
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Router serving `/metrics` and `/health`
pub fn router() -> Router {
    Router::new()
        .route("/metrics", get(|| async { encode_metrics() }))
        .route(
            "/health",
            get(|| async {
                if HEALTH_STATUS.get() >= 1.0 {
                    (StatusCode::OK, "ok")
                } else {
                    (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
                }
            }),
        )
}

/// Serve the metrics router until the task is dropped
pub async fn serve(port: u16) -> crate::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        crate::Git2KvError::Hook(format!("Failed to bind metrics port {}: {}", port, e))
    })?;

    tracing::info!(%addr, "Metrics endpoint listening");
    axum::serve(listener, router()).await?;
    Ok(())
}
