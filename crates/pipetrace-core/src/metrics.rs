//! Prometheus metrics helpers shared by the pipetrace binaries.
//!
//! Provides centralized recorder initialization and the metric descriptions
//! used across the ingest path, the aggregation API, and the operational
//! jobs.
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`ingest_`, `query_`, `reconcile_`, `retention_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: used sparingly to avoid cardinality explosion

use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// Must be called once at startup before any metrics are recorded. Returns a
/// handle for [`start_metrics_server`].
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Like [`init_metrics`] but returns `None` if a recorder is already
/// installed. Useful for tests.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

/// Start the `/metrics` HTTP server on the given port.
///
/// Spawns a background task and returns immediately.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("metrics server exited: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for the metrics used across pipetrace.
fn register_common_metrics() {
    // =========================================================================
    // Ingest API
    // =========================================================================

    describe_counter!(
        "ingest_events_total",
        "Total events received on the ingest endpoints"
    );
    describe_counter!(
        "ingest_events_created_total",
        "Events accepted and stored as new rows"
    );
    describe_counter!(
        "ingest_events_duplicate_total",
        "Events resolved as idempotent duplicates"
    );
    describe_counter!(
        "ingest_events_invalid_total",
        "Events rejected by validation"
    );
    describe_counter!(
        "ingest_events_late_total",
        "Accepted events older than the late threshold"
    );
    describe_counter!(
        "ingest_rate_limited_total",
        "Events rejected by the ingest rate limiter"
    );
    describe_counter!(
        "ingest_articles_created_total",
        "Articles upserted for the first time"
    );
    describe_histogram!(
        "ingest_insert_duration_seconds",
        "Time spent on event store inserts"
    );

    // =========================================================================
    // Aggregation queries
    // =========================================================================

    describe_counter!("query_funnel_total", "Funnel report requests");
    describe_counter!("query_stats_total", "Stats report requests");
    describe_counter!("query_drift_total", "Drift report requests");
    describe_counter!("query_cache_hits_total", "Aggregate responses served from cache");

    // =========================================================================
    // Reconciliation / retention jobs
    // =========================================================================

    describe_counter!(
        "reconcile_gaps_expected_total",
        "Count deltas matched to a known outage window"
    );
    describe_counter!(
        "reconcile_gaps_unexpected_total",
        "Count deltas flagged for investigation"
    );
    describe_counter!(
        "reconcile_events_replayed_total",
        "Audit rows re-emitted through the ingest path"
    );
    describe_gauge!(
        "reconcile_running",
        "Whether a reconciliation run is in progress (1=yes, 0=no)"
    );
    describe_counter!(
        "retention_partitions_dropped_total",
        "Expired event partitions dropped by the retention sweep"
    );
}
