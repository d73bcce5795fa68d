//! API route definitions.

mod drift;
mod funnel;
mod health;
mod ingest;
mod stats;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build the complete API router.
///
/// # Route Structure
///
/// ## Ingest
/// - `POST /events` - Accept one event (201 created, 200 duplicate)
/// - `POST /events/batch` - Accept many events with per-event outcomes
///
/// ## Reports
/// - `GET /funnel` - Per-stage counts in pipeline order
/// - `GET /stats` - Volumes, quality, publish failures, throughput
/// - `GET /stats/drift` - Per-model-version drift summary
///
/// ## Probes
/// - `GET /health` - Liveness
/// - `GET /ready` - Readiness (pings ClickHouse)
///
/// Authentication is assumed to happen upstream; there is no auth layer.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/events", post(ingest::ingest_event))
        .route("/events/batch", post(ingest::ingest_batch))
        .route("/funnel", get(funnel::funnel))
        .route("/stats", get(stats::stats))
        .route("/stats/drift", get(drift::drift))
        .route("/health", get(health::health_check))
        .route("/ready", get(health::ready))
        .with_state(state)
}
