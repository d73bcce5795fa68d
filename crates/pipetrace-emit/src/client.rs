//! The fire-and-forget emission client.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

use pipetrace_core::{url_hash_short, EventDraft};

use crate::breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use crate::error::{EmitError, EmitResult};

/// Default bounded timeout for a single emission request.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Emission client configuration.
#[derive(Debug, Clone)]
pub struct EmitConfig {
    /// Base URL of the ingest API (e.g. `http://pipetrace:8075`). When
    /// `None`, the client is inert and every call is a free no-op.
    pub endpoint: Option<String>,
    /// Name of the emitting producer, stamped on every event.
    pub service_name: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Circuit breaker thresholds.
    pub breaker: BreakerConfig,
}

impl EmitConfig {
    /// Config for a producer with an ingest endpoint.
    pub fn new(endpoint: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            service_name: service_name.into(),
            timeout: DEFAULT_TIMEOUT,
            breaker: BreakerConfig::default(),
        }
    }

    /// Config for a producer without telemetry; all calls become no-ops.
    /// This lets every producer instrument itself unconditionally.
    pub fn disabled(service_name: impl Into<String>) -> Self {
        Self {
            endpoint: None,
            service_name: service_name.into(),
            timeout: DEFAULT_TIMEOUT,
            breaker: BreakerConfig::default(),
        }
    }
}

/// Outcome of an emission attempt. Callers are free to ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    /// The ingest API accepted the event(s).
    Sent,
    /// No endpoint configured; nothing was attempted.
    Disabled,
    /// The circuit breaker is open; nothing was attempted.
    BreakerOpen,
}

/// Per-event acceptance counts from the ingest API's reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
pub struct BatchReceipt {
    #[serde(default)]
    pub created: usize,
    #[serde(default)]
    pub duplicates: usize,
    #[serde(default)]
    pub invalid: usize,
}

impl BatchReceipt {
    /// Events the store now holds a row for (new or idempotent duplicate).
    pub fn accepted(&self) -> usize {
        self.created + self.duplicates
    }
}

/// Outcome of a batch emission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The ingest API answered; the receipt says what it did per event.
    Sent(BatchReceipt),
    /// No endpoint configured; nothing was attempted.
    Disabled,
    /// The circuit breaker is open; nothing was attempted.
    BreakerOpen,
}

/// Wire shape posted to the ingest API.
#[derive(Debug, Serialize)]
struct WireEvent<'a> {
    article_url: &'a str,
    source_name: &'a str,
    stage: pipetrace_core::Stage,
    occurred_at: DateTime<Utc>,
    service_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    idempotency_key: Option<&'a str>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    metadata: &'a Map<String, Value>,
}

#[derive(Debug, Serialize)]
struct WireBatch<'a> {
    events: Vec<WireEvent<'a>>,
}

/// Reply shape of `POST /events`.
#[derive(Debug, serde::Deserialize)]
struct WireSingleReply {
    status: String,
}

#[derive(Debug)]
struct Enabled {
    http: reqwest::Client,
    base_url: String,
    breaker: CircuitBreaker,
}

/// Fire-and-forget emitter for pipeline events.
///
/// Cheap to clone; one instance per process is shared by all workers.
#[derive(Debug, Clone)]
pub struct EmitClient {
    service_name: Arc<str>,
    enabled: Option<Arc<Enabled>>,
}

impl EmitClient {
    /// Build a client from configuration.
    ///
    /// # Errors
    ///
    /// Fails only if the underlying HTTP client cannot be constructed.
    pub fn new(config: EmitConfig) -> EmitResult<Self> {
        let enabled = match config.endpoint {
            Some(endpoint) => {
                let http = reqwest::Client::builder()
                    .timeout(config.timeout)
                    .build()?;
                Some(Arc::new(Enabled {
                    http,
                    base_url: endpoint.trim_end_matches('/').to_string(),
                    breaker: CircuitBreaker::new(config.breaker),
                }))
            }
            None => None,
        };

        Ok(Self {
            service_name: config.service_name.into(),
            enabled,
        })
    }

    /// Whether an ingest endpoint is configured.
    pub fn is_enabled(&self) -> bool {
        self.enabled.is_some()
    }

    /// Current breaker state, for the producer's health surface. A disabled
    /// client always reports `Closed`.
    pub fn breaker_state(&self) -> BreakerState {
        self.enabled
            .as_ref()
            .map_or(BreakerState::Closed, |e| e.breaker.state())
    }

    /// Emit a single event.
    ///
    /// Stamps `occurred_at` with the current UTC time when the draft carries
    /// none, so producers cannot emit skewed or local-time values. The error
    /// is returned for callers that specifically check it; pipeline logic
    /// should treat failures as logged warnings only.
    pub async fn emit(&self, event: EventDraft) -> EmitResult<EmitOutcome> {
        Ok(match self.emit_batch(vec![event]).await? {
            BatchOutcome::Sent(_) => EmitOutcome::Sent,
            BatchOutcome::Disabled => EmitOutcome::Disabled,
            BatchOutcome::BreakerOpen => EmitOutcome::BreakerOpen,
        })
    }

    /// Emit a batch of events in one request.
    ///
    /// Each event keeps its own `occurred_at`; unset ones are stamped at call
    /// time. The returned receipt carries the server's per-event accounting,
    /// which callers that replay (reconciliation) must consult: a 2xx reply
    /// can still report events rejected as invalid.
    pub async fn emit_batch(&self, events: Vec<EventDraft>) -> EmitResult<BatchOutcome> {
        let Some(enabled) = &self.enabled else {
            return Ok(BatchOutcome::Disabled);
        };
        if events.is_empty() {
            return Ok(BatchOutcome::Sent(BatchReceipt::default()));
        }

        if !enabled.breaker.allow() {
            return Ok(BatchOutcome::BreakerOpen);
        }

        let stamped_at = Utc::now();
        let single = events.len() == 1;

        let wire: Vec<WireEvent<'_>> = events
            .iter()
            .map(|e| WireEvent {
                article_url: &e.article_url,
                source_name: &e.source_name,
                stage: e.stage,
                occurred_at: e.occurred_at.unwrap_or(stamped_at),
                service_name: e.service_name.as_deref().unwrap_or(&self.service_name),
                idempotency_key: e.idempotency_key.as_deref(),
                metadata: &e.metadata,
            })
            .collect();

        let (path, body) = if single {
            ("/events", serde_json::to_vec(&wire[0])?)
        } else {
            ("/events/batch", serde_json::to_vec(&WireBatch { events: wire })?)
        };

        let reply = match self.post(enabled, path, body).await {
            Ok(reply) => {
                enabled.breaker.record_success();
                reply
            }
            Err(err) => {
                enabled.breaker.record_failure();
                return Err(err);
            }
        };

        let receipt = if single {
            let reply: WireSingleReply = serde_json::from_slice(&reply)?;
            if reply.status == "created" {
                BatchReceipt {
                    created: 1,
                    ..Default::default()
                }
            } else {
                BatchReceipt {
                    duplicates: 1,
                    ..Default::default()
                }
            }
        } else {
            serde_json::from_slice(&reply)?
        };

        Ok(BatchOutcome::Sent(receipt))
    }

    /// Fire-and-forget emission on a detached task.
    ///
    /// The spawned task logs failures with enough structure to trace the
    /// event (stage, article hash, producer) and never reports back.
    pub fn emit_detached(&self, event: EventDraft) {
        if self.enabled.is_none() {
            return;
        }
        let client = self.clone();
        tokio::spawn(async move {
            let stage = event.stage;
            let article = url_hash_short(&event.article_url);
            match client.emit(event).await {
                Ok(EmitOutcome::BreakerOpen) => {
                    tracing::debug!(%stage, article = %article, "emission skipped, breaker open");
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(
                        %stage,
                        article = %article,
                        service = %client.service_name,
                        error = %err,
                        "failed to emit pipeline event"
                    );
                }
            }
        });
    }

    async fn post(&self, enabled: &Enabled, path: &str, body: Vec<u8>) -> EmitResult<Vec<u8>> {
        let url = format!("{}{}", enabled.base_url, path);
        let resp = enabled
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(EmitError::Status(status.as_u16()));
        }

        Ok(resp.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use pipetrace_core::Stage;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn draft(url: &str) -> EventDraft {
        EventDraft {
            article_url: url.to_string(),
            source_name: "wire".to_string(),
            stage: Stage::Crawled,
            service_name: None,
            occurred_at: None,
            idempotency_key: None,
            metadata: Map::new(),
        }
    }

    async fn serve_app(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    /// Start a tiny ingest stub; returns its base URL and a request counter.
    /// Answers with the real API's reply shapes: `{status}` for single
    /// events, acceptance counts for batches.
    async fn spawn_stub(status: StatusCode) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);

        let handler = move |Json(body): Json<Value>| {
            let hits = Arc::clone(&hits_clone);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                let reply = match body.get("events").and_then(Value::as_array) {
                    Some(events) => serde_json::json!({
                        "results": [],
                        "created": events.len(),
                        "duplicates": 0,
                        "invalid": 0
                    }),
                    None => {
                        // Single events carry a service name and a timestamp.
                        let obj = body.as_object().unwrap();
                        assert!(obj.contains_key("service_name"));
                        assert!(obj.contains_key("occurred_at"));
                        serde_json::json!({"status": "created", "idempotency_key": "k"})
                    }
                };
                (status, Json(reply))
            }
        };

        let app = Router::new()
            .route("/events", post(handler.clone()))
            .route("/events/batch", post(handler));

        (serve_app(app).await, hits)
    }

    #[tokio::test]
    async fn test_disabled_client_is_inert() {
        let client = EmitClient::new(EmitConfig::disabled("crawler")).unwrap();
        assert!(!client.is_enabled());
        let outcome = client.emit(draft("https://x.test/a")).await.unwrap();
        assert_eq!(outcome, EmitOutcome::Disabled);
        assert_eq!(client.breaker_state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_emit_posts_single_event() {
        let (base, hits) = spawn_stub(StatusCode::CREATED).await;
        let client = EmitClient::new(EmitConfig::new(base, "crawler")).unwrap();

        let outcome = client.emit(draft("https://x.test/a")).await.unwrap();
        assert_eq!(outcome, EmitOutcome::Sent);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_emit_batch_is_one_request() {
        let (base, hits) = spawn_stub(StatusCode::CREATED).await;
        let client = EmitClient::new(EmitConfig::new(base, "crawler")).unwrap();

        let events = vec![draft("https://x.test/a"), draft("https://x.test/b")];
        let outcome = client.emit_batch(events).await.unwrap();
        assert_eq!(
            outcome,
            BatchOutcome::Sent(BatchReceipt {
                created: 2,
                duplicates: 0,
                invalid: 0
            })
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_batch_receipt_surfaces_rejections() {
        // A 2xx batch reply can still report invalid events; the receipt
        // must carry them so replay jobs don't count rejected events.
        let handler = |Json(_): Json<Value>| async {
            Json(serde_json::json!({
                "results": [],
                "created": 1,
                "duplicates": 1,
                "invalid": 2
            }))
        };
        let app = Router::new().route("/events/batch", post(handler));
        let base = serve_app(app).await;

        let client = EmitClient::new(EmitConfig::new(base, "crawler")).unwrap();
        let events = vec![
            draft("https://x.test/a"),
            draft("https://x.test/b"),
            draft("https://x.test/c"),
            draft("https://x.test/d"),
        ];
        let outcome = client.emit_batch(events).await.unwrap();
        let BatchOutcome::Sent(receipt) = outcome else {
            panic!("expected a sent batch, got {:?}", outcome);
        };
        assert_eq!(receipt.accepted(), 2);
        assert_eq!(receipt.invalid, 2);
    }

    #[tokio::test]
    async fn test_draft_service_name_overrides_client() {
        // Replayed backfill must be attributed to the gapped producer, not
        // to the job doing the replaying.
        let seen: Arc<std::sync::Mutex<Vec<Value>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let handler = move |Json(body): Json<Value>| {
            let seen = Arc::clone(&seen_clone);
            async move {
                seen.lock().unwrap().push(body);
                Json(serde_json::json!({
                    "results": [],
                    "created": 2,
                    "duplicates": 0,
                    "invalid": 0
                }))
            }
        };
        let app = Router::new().route("/events/batch", post(handler));
        let base = serve_app(app).await;

        let client = EmitClient::new(EmitConfig::new(base, "pipetrace-reconcile")).unwrap();
        let mut attributed = draft("https://x.test/a");
        attributed.service_name = Some("crawler".to_string());
        client
            .emit_batch(vec![attributed, draft("https://x.test/b")])
            .await
            .unwrap();

        let bodies = seen.lock().unwrap();
        let events = bodies[0]["events"].as_array().unwrap();
        assert_eq!(events[0]["service_name"], "crawler");
        assert_eq!(events[1]["service_name"], "pipetrace-reconcile");
    }

    #[tokio::test]
    async fn test_breaker_opens_and_stops_network_calls() {
        let (base, hits) = spawn_stub(StatusCode::INTERNAL_SERVER_ERROR).await;
        let mut config = EmitConfig::new(base, "crawler");
        config.breaker.cooldown = Duration::from_secs(60);
        let client = EmitClient::new(config).unwrap();

        for _ in 0..5 {
            let err = client.emit(draft("https://x.test/a")).await;
            assert!(matches!(err, Err(EmitError::Status(500))));
        }
        assert_eq!(client.breaker_state(), BreakerState::Open);
        assert_eq!(hits.load(Ordering::SeqCst), 5);

        // Breaker open: no network attempt is made.
        let outcome = client.emit(draft("https://x.test/a")).await.unwrap();
        assert_eq!(outcome, EmitOutcome::BreakerOpen);
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_breaker_recovers_after_cooldown() {
        let (base, _hits) = spawn_stub(StatusCode::INTERNAL_SERVER_ERROR).await;
        let (good_base, _good_hits) = spawn_stub(StatusCode::CREATED).await;

        let mut config = EmitConfig::new(base, "crawler");
        config.breaker.cooldown = Duration::from_millis(20);
        let client = EmitClient::new(config).unwrap();

        for _ in 0..5 {
            let _ = client.emit(draft("https://x.test/a")).await;
        }
        assert_eq!(client.breaker_state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;

        // Recovery requires two consecutive successes; probe against the
        // healthy stub by swapping base URLs through a fresh client sharing
        // nothing - instead just drive the breaker directly.
        let breaker = CircuitBreaker::new(BreakerConfig {
            cooldown: Duration::from_millis(20),
            ..Default::default()
        });
        for _ in 0..5 {
            breaker.record_failure();
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(breaker.allow());
        breaker.record_success();
        assert!(breaker.allow());
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);

        // The healthy endpoint accepts events normally.
        let healthy = EmitClient::new(EmitConfig::new(good_base, "crawler")).unwrap();
        let outcome = healthy.emit(draft("https://x.test/a")).await.unwrap();
        assert_eq!(outcome, EmitOutcome::Sent);
    }

    #[tokio::test]
    async fn test_occurred_at_preserved_when_set() {
        let (base, hits) = spawn_stub(StatusCode::CREATED).await;
        let client = EmitClient::new(EmitConfig::new(base, "classifier")).unwrap();

        let mut event = draft("https://x.test/a");
        event.occurred_at = Some("2026-02-10T10:00:00Z".parse().unwrap());
        let outcome = client.emit(event).await.unwrap();
        assert_eq!(outcome, EmitOutcome::Sent);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
