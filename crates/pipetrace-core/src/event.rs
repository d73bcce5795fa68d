//! Pipeline events, ingest request shapes, and idempotency keys.
//!
//! A [`PipelineEvent`] is an immutable fact: "this article reached this stage
//! at this time". Events are deduplicated by a deterministic idempotency key
//! so producers can safely retry and reconciliation can safely replay.

use chrono::{DateTime, Duration, FixedOffset, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::article::url_hash_short;
use crate::error::{Error, Result};
use crate::stage::Stage;

/// Current version of the per-stage metadata payload shape.
pub const METADATA_SCHEMA_VERSION: u16 = 1;

/// Separator used inside idempotency keys.
const KEY_SEPARATOR: &str = ":";

/// A single stage transition for an article, as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub article_url: String,
    pub stage: Stage,
    pub occurred_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub service_name: String,
    pub source_name: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    pub metadata_schema_version: u16,
    pub idempotency_key: String,
}

/// Payload accepted by `POST /events`.
///
/// `occurred_at` keeps its parsed offset so UTC-ness can be enforced; `stage`
/// stays a string until validation so an unknown stage is reported as a stage
/// error rather than a decode failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub article_url: String,
    pub source_name: String,
    pub stage: String,
    pub occurred_at: DateTime<FixedOffset>,
    pub service_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// Payload accepted by `POST /events/batch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchIngestRequest {
    pub events: Vec<IngestRequest>,
}

/// An event as a producer describes it, before the emission client fills in
/// the service name and stamps `occurred_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDraft {
    pub article_url: String,
    pub source_name: String,
    pub stage: Stage,
    /// Producer to attribute the event to; the emission client's own service
    /// name when absent. Reconciliation replays set this so backfill lands
    /// under the gapped producer, not the reconcile job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    /// Stamped by the emission client in UTC when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// Bounds applied to incoming `occurred_at` timestamps.
#[derive(Debug, Clone, Copy)]
pub struct ValidationLimits {
    /// Maximum age of an event relative to arrival.
    pub max_event_age: Duration,
    /// Allowance for producer clocks running ahead of ours.
    pub max_future_skew: Duration,
    /// Age past which an accepted event is logged as late.
    pub late_threshold: Duration,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_event_age: Duration::hours(24),
            max_future_skew: Duration::zero(),
            late_threshold: Duration::hours(1),
        }
    }
}

impl ValidationLimits {
    /// Validate an ingest request against `now`.
    ///
    /// Check order is fixed: timestamp (UTC offset, future skew, recency
    /// window), then required-field presence, then stage membership. Returns
    /// the parsed stage on success.
    pub fn validate(&self, req: &IngestRequest, now: DateTime<Utc>) -> Result<Stage> {
        if req.occurred_at.offset().local_minus_utc() != 0 {
            return Err(Error::Timestamp(format!(
                "occurred_at must be UTC, got offset {}",
                req.occurred_at.offset()
            )));
        }

        let occurred_at = req.occurred_at.with_timezone(&Utc);

        if occurred_at > now + self.max_future_skew {
            return Err(Error::Timestamp(
                "occurred_at must not be in the future".to_string(),
            ));
        }

        if now - occurred_at > self.max_event_age {
            return Err(Error::Timestamp(format!(
                "occurred_at must not be more than {} hours in the past",
                self.max_event_age.num_hours()
            )));
        }

        if req.article_url.trim().is_empty() {
            return Err(Error::MissingField("article_url"));
        }
        if req.source_name.trim().is_empty() {
            return Err(Error::MissingField("source_name"));
        }
        if req.service_name.trim().is_empty() {
            return Err(Error::MissingField("service_name"));
        }

        req.stage.parse::<Stage>()
    }

    /// Whether an accepted event should be logged as late.
    pub fn is_late(&self, occurred_at: DateTime<Utc>, received_at: DateTime<Utc>) -> bool {
        received_at - occurred_at > self.late_threshold
    }
}

/// Derive the deterministic idempotency key for an event.
///
/// Format: `{service}:{stage}:{url_hash8}:{occurred_at RFC3339}`. For
/// classification events a model version from the metadata is folded in, so
/// reclassifying the same article under a new model produces a new fact
/// instead of a silently dropped duplicate.
pub fn derive_idempotency_key(
    service_name: &str,
    stage: Stage,
    article_url: &str,
    occurred_at: DateTime<Utc>,
    metadata: &Map<String, Value>,
) -> String {
    let mut parts = vec![
        service_name.to_string(),
        stage.as_str().to_string(),
        url_hash_short(article_url),
        occurred_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    ];

    if stage == Stage::Classified {
        if let Some(model) = metadata_str(metadata, "model_version") {
            parts.push(model.to_string());
        }
    }

    parts.join(KEY_SEPARATOR)
}

/// Fetch a string field from an event metadata payload.
pub fn metadata_str<'a>(metadata: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    metadata.get(key).and_then(Value::as_str)
}

/// Fetch a numeric field from an event metadata payload.
pub fn metadata_f64(metadata: &Map<String, Value>, key: &str) -> Option<f64> {
    metadata.get(key).and_then(Value::as_f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn req(occurred_at: DateTime<FixedOffset>) -> IngestRequest {
        IngestRequest {
            article_url: "https://x.test/a".to_string(),
            source_name: "wire".to_string(),
            stage: "crawled".to_string(),
            occurred_at,
            service_name: "crawler".to_string(),
            idempotency_key: None,
            metadata: Map::new(),
        }
    }

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_validate_accepts_recent_utc() {
        let now = utc("2026-02-10T12:00:00Z");
        let r = req("2026-02-10T10:00:00Z".parse().unwrap());
        let stage = ValidationLimits::default().validate(&r, now).unwrap();
        assert_eq!(stage, Stage::Crawled);
    }

    #[test]
    fn test_validate_rejects_non_utc_offset() {
        let now = utc("2026-02-10T12:00:00Z");
        let r = req("2026-02-10T10:00:00+02:00".parse().unwrap());
        let err = ValidationLimits::default().validate(&r, now).unwrap_err();
        assert!(matches!(err, Error::Timestamp(_)));
    }

    #[test]
    fn test_validate_window_edges() {
        let limits = ValidationLimits::default();
        let now = utc("2026-02-10T12:00:00Z");

        // 23 hours old: accepted.
        let r = req("2026-02-09T13:00:00Z".parse().unwrap());
        assert!(limits.validate(&r, now).is_ok());

        // 25 hours old: rejected.
        let r = req("2026-02-09T11:00:00Z".parse().unwrap());
        assert!(limits.validate(&r, now).is_err());

        // 1 second in the future: rejected with zero skew allowance.
        let r = req("2026-02-10T12:00:01Z".parse().unwrap());
        assert!(limits.validate(&r, now).is_err());

        // Same second is fine.
        let r = req("2026-02-10T12:00:00Z".parse().unwrap());
        assert!(limits.validate(&r, now).is_ok());
    }

    #[test]
    fn test_validate_future_skew_is_configurable() {
        let limits = ValidationLimits {
            max_future_skew: Duration::seconds(5),
            ..Default::default()
        };
        let now = utc("2026-02-10T12:00:00Z");
        let r = req("2026-02-10T12:00:04Z".parse().unwrap());
        assert!(limits.validate(&r, now).is_ok());
    }

    #[test]
    fn test_validate_required_fields_before_stage() {
        let now = utc("2026-02-10T12:00:00Z");
        let mut r = req("2026-02-10T10:00:00Z".parse().unwrap());
        r.article_url = "  ".to_string();
        r.stage = "bogus".to_string();
        // Field presence is checked before stage membership.
        let err = ValidationLimits::default().validate(&r, now).unwrap_err();
        assert!(matches!(err, Error::MissingField("article_url")));
    }

    #[test]
    fn test_validate_unknown_stage() {
        let now = utc("2026-02-10T12:00:00Z");
        let mut r = req("2026-02-10T10:00:00Z".parse().unwrap());
        r.stage = "deployed".to_string();
        let err = ValidationLimits::default().validate(&r, now).unwrap_err();
        assert!(matches!(err, Error::UnknownStage(_)));
    }

    #[test]
    fn test_is_late() {
        let limits = ValidationLimits::default();
        let occurred = utc("2026-02-10T10:00:00Z");
        assert!(!limits.is_late(occurred, utc("2026-02-10T10:59:00Z")));
        assert!(limits.is_late(occurred, utc("2026-02-10T11:00:01Z")));
    }

    #[test]
    fn test_idempotency_key_shape() {
        let occurred = Utc.with_ymd_and_hms(2026, 2, 10, 10, 0, 0).unwrap();
        let key = derive_idempotency_key(
            "crawler",
            Stage::Crawled,
            "https://x.test/a",
            occurred,
            &Map::new(),
        );
        let parts: Vec<&str> = key.split(':').collect();
        assert_eq!(parts[0], "crawler");
        assert_eq!(parts[1], "crawled");
        assert_eq!(parts[2].len(), 8);
        assert!(key.ends_with("2026-02-10T10:00:00Z"));
    }

    #[test]
    fn test_idempotency_key_folds_model_version_for_classified() {
        let occurred = Utc.with_ymd_and_hms(2026, 2, 10, 10, 0, 0).unwrap();
        let mut metadata = Map::new();
        metadata.insert("model_version".to_string(), Value::from("v2"));

        let with_model = derive_idempotency_key(
            "classifier",
            Stage::Classified,
            "https://x.test/a",
            occurred,
            &metadata,
        );
        let without = derive_idempotency_key(
            "classifier",
            Stage::Classified,
            "https://x.test/a",
            occurred,
            &Map::new(),
        );
        assert_ne!(with_model, without);
        assert!(with_model.ends_with(":v2"));

        // Other stages ignore model_version.
        let routed = derive_idempotency_key(
            "publisher",
            Stage::Routed,
            "https://x.test/a",
            occurred,
            &metadata,
        );
        assert!(!routed.ends_with(":v2"));
    }

    #[test]
    fn test_idempotency_key_is_deterministic() {
        let occurred = Utc.with_ymd_and_hms(2026, 2, 10, 10, 0, 0).unwrap();
        let a = derive_idempotency_key("s", Stage::Indexed, "https://x.test/a", occurred, &Map::new());
        let b = derive_idempotency_key("s", Stage::Indexed, "https://x.test/a", occurred, &Map::new());
        assert_eq!(a, b);
    }
}
