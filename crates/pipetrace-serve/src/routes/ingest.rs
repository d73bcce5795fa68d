//! Event ingest endpoints.
//!
//! `POST /events` accepts one event, `POST /events/batch` accepts many with
//! per-event outcomes and no rollback. Validation order is fixed: timestamp
//! checks, then required fields, then stage membership. Late events (older
//! than an hour on arrival) are logged and accepted.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use metrics::{counter, histogram};
use serde::Serialize;
use std::time::Instant;

use pipetrace_core::{
    derive_idempotency_key, BatchIngestRequest, IngestRequest, PipelineEvent, Stage,
    ValidationLimits, METADATA_SCHEMA_VERSION,
};
use pipetrace_ingest::InsertOutcome;

use crate::error::ApiError;
use crate::rate_limit::RateLimitResult;
use crate::state::AppState;

/// Response for a single accepted event.
#[derive(Debug, Clone, Serialize)]
pub struct IngestResponse {
    /// `created` or `duplicate`.
    pub status: &'static str,
    pub idempotency_key: String,
}

/// Per-event outcome inside a batch response.
#[derive(Debug, Clone, Serialize)]
pub struct BatchItemResult {
    pub index: usize,
    /// `created`, `duplicate`, or `invalid`.
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response for a batch request.
#[derive(Debug, Clone, Serialize)]
pub struct BatchIngestResponse {
    pub results: Vec<BatchItemResult>,
    pub created: usize,
    pub duplicates: usize,
    pub invalid: usize,
}

/// `POST /events`
pub async fn ingest_event(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    counter!("ingest_events_total").increment(1);

    if let RateLimitResult::Limited {
        limit,
        retry_after_secs,
    } = state.rate_limit.check_events(1)
    {
        counter!("ingest_rate_limited_total").increment(1);
        return Err(ApiError::RateLimited {
            limit,
            retry_after_secs,
        });
    }

    let now = Utc::now();
    let stage = match state.limits.validate(&req, now) {
        Ok(stage) => stage,
        Err(err) => {
            counter!("ingest_events_invalid_total").increment(1);
            return Err(ApiError::BadRequest(err.to_string()));
        }
    };

    let event = build_event(req, stage, &state.limits, now);

    let started = Instant::now();
    let outcome = state.store.insert_event(&event).await?;
    histogram!("ingest_insert_duration_seconds").record(started.elapsed().as_secs_f64());

    Ok(match outcome {
        InsertOutcome::Inserted => {
            counter!("ingest_events_created_total").increment(1);
            (
                StatusCode::CREATED,
                Json(IngestResponse {
                    status: "created",
                    idempotency_key: event.idempotency_key,
                }),
            )
        }
        InsertOutcome::Duplicate => {
            counter!("ingest_events_duplicate_total").increment(1);
            (
                StatusCode::OK,
                Json(IngestResponse {
                    status: "duplicate",
                    idempotency_key: event.idempotency_key,
                }),
            )
        }
    })
}

/// `POST /events/batch`
///
/// Each event is validated and stored independently; one bad event never
/// fails its neighbours.
pub async fn ingest_batch(
    State(state): State<AppState>,
    Json(req): Json<BatchIngestRequest>,
) -> Result<(StatusCode, Json<BatchIngestResponse>), ApiError> {
    counter!("ingest_events_total").increment(req.events.len() as u64);

    if let RateLimitResult::Limited {
        limit,
        retry_after_secs,
    } = state.rate_limit.check_events(req.events.len() as u32)
    {
        counter!("ingest_rate_limited_total").increment(req.events.len() as u64);
        return Err(ApiError::RateLimited {
            limit,
            retry_after_secs,
        });
    }

    let now = Utc::now();
    let mut results: Vec<Option<BatchItemResult>> = vec![None; req.events.len()];
    let mut valid = Vec::new();
    let mut valid_indexes = Vec::new();
    let mut invalid = 0usize;

    for (index, event_req) in req.events.into_iter().enumerate() {
        match state.limits.validate(&event_req, now) {
            Ok(stage) => {
                valid.push(build_event(event_req, stage, &state.limits, now));
                valid_indexes.push(index);
            }
            Err(err) => {
                counter!("ingest_events_invalid_total").increment(1);
                invalid += 1;
                results[index] = Some(BatchItemResult {
                    index,
                    status: "invalid",
                    idempotency_key: None,
                    error: Some(err.to_string()),
                });
            }
        }
    }

    let started = Instant::now();
    let outcomes = state.store.insert_batch(&valid).await?;
    histogram!("ingest_insert_duration_seconds").record(started.elapsed().as_secs_f64());

    let mut created = 0usize;
    let mut duplicates = 0usize;
    for ((index, event), outcome) in valid_indexes.iter().zip(&valid).zip(&outcomes) {
        let status = match outcome {
            InsertOutcome::Inserted => {
                counter!("ingest_events_created_total").increment(1);
                created += 1;
                "created"
            }
            InsertOutcome::Duplicate => {
                counter!("ingest_events_duplicate_total").increment(1);
                duplicates += 1;
                "duplicate"
            }
        };
        results[*index] = Some(BatchItemResult {
            index: *index,
            status,
            idempotency_key: Some(event.idempotency_key.clone()),
            error: None,
        });
    }

    let results: Vec<BatchItemResult> = results.into_iter().flatten().collect();
    Ok((
        batch_status(created, duplicates, invalid),
        Json(BatchIngestResponse {
            results,
            created,
            duplicates,
            invalid,
        }),
    ))
}

/// 201 when the whole batch was created, 200 for any mix of duplicates,
/// rejects, or an empty batch.
fn batch_status(created: usize, duplicates: usize, invalid: usize) -> StatusCode {
    if created > 0 && duplicates == 0 && invalid == 0 {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    }
}

/// Build the stored event from a validated request.
///
/// The idempotency key is derived server-side unless the producer supplied
/// its own; `received_at` is stamped here.
fn build_event(
    req: IngestRequest,
    stage: Stage,
    limits: &ValidationLimits,
    now: chrono::DateTime<Utc>,
) -> PipelineEvent {
    let occurred_at = req.occurred_at.with_timezone(&Utc);

    if limits.is_late(occurred_at, now) {
        counter!("ingest_events_late_total").increment(1);
        tracing::warn!(
            article_url = %req.article_url,
            stage = %stage,
            occurred_at = %occurred_at,
            lag_secs = (now - occurred_at).num_seconds(),
            "late event accepted"
        );
    }

    let idempotency_key = req.idempotency_key.unwrap_or_else(|| {
        derive_idempotency_key(
            &req.service_name,
            stage,
            &req.article_url,
            occurred_at,
            &req.metadata,
        )
    });

    PipelineEvent {
        article_url: req.article_url,
        stage,
        occurred_at,
        received_at: now,
        service_name: req.service_name,
        source_name: req.source_name,
        metadata: req.metadata,
        metadata_schema_version: METADATA_SCHEMA_VERSION,
        idempotency_key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, FixedOffset};
    use serde_json::Map;

    fn req(occurred_at: &str) -> IngestRequest {
        IngestRequest {
            article_url: "https://x.test/a".to_string(),
            source_name: "wire".to_string(),
            stage: "crawled".to_string(),
            occurred_at: occurred_at.parse::<DateTime<FixedOffset>>().unwrap(),
            service_name: "crawler".to_string(),
            idempotency_key: None,
            metadata: Map::new(),
        }
    }

    #[test]
    fn test_build_event_derives_key() {
        let now = "2026-02-10T12:00:00Z".parse().unwrap();
        let event = build_event(
            req("2026-02-10T10:00:00Z"),
            Stage::Crawled,
            &ValidationLimits::default(),
            now,
        );
        assert!(event.idempotency_key.starts_with("crawler:crawled:"));
        assert_eq!(event.received_at, now);
        assert_eq!(event.metadata_schema_version, METADATA_SCHEMA_VERSION);
    }

    #[test]
    fn test_batch_status() {
        assert_eq!(batch_status(3, 0, 0), StatusCode::CREATED);
        assert_eq!(batch_status(2, 1, 0), StatusCode::OK);
        assert_eq!(batch_status(2, 0, 1), StatusCode::OK);
        assert_eq!(batch_status(0, 3, 0), StatusCode::OK);
        assert_eq!(batch_status(0, 0, 0), StatusCode::OK);
    }

    #[test]
    fn test_build_event_keeps_caller_key() {
        let now = "2026-02-10T12:00:00Z".parse().unwrap();
        let mut r = req("2026-02-10T10:00:00Z");
        r.idempotency_key = Some("custom-key".to_string());
        let event = build_event(r, Stage::Crawled, &ValidationLimits::default(), now);
        assert_eq!(event.idempotency_key, "custom-key");
    }
}
