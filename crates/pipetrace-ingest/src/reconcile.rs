//! Reconciliation and backfill.
//!
//! Compares what each producer's audit trail says happened against what the
//! event store recorded, classifies any shortfall against configured outage
//! windows, and replays the missing events through the normal ingest path
//! with `backfilled: true` metadata. Because ingest is idempotent, running
//! reconciliation twice (or while producers are live) is always safe.

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{info, warn};

use pipetrace_core::Stage;
use pipetrace_emit::{BatchOutcome, EmitClient};

use crate::audit::{AuditReader, AuditRow};
use crate::error::Result;
use crate::store::EventStore;

/// Replay batch size per ingest request.
const REPLAY_BATCH: usize = 500;

/// Reconciliation configuration, loaded from TOML.
///
/// Timestamps in outage windows are RFC 3339 strings.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default)]
    pub producers: Vec<ProducerConfig>,
    #[serde(default)]
    pub outages: Vec<OutageWindow>,
}

impl ReconcileConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

/// One producer to reconcile: who it is, what stage it reports, and where
/// its audit trail lives.
#[derive(Debug, Clone, Deserialize)]
pub struct ProducerConfig {
    pub service_name: String,
    pub stage: Stage,
    pub audit_db: PathBuf,
}

/// A known outage. Gaps inside it are expected and not replayed blindly;
/// the annotation explains why the data is missing.
#[derive(Debug, Clone, Deserialize)]
pub struct OutageWindow {
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub annotation: String,
    /// Services the outage applies to; empty means all.
    #[serde(default)]
    pub services: Vec<String>,
}

impl OutageWindow {
    fn covers(&self, service_name: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        let service_match =
            self.services.is_empty() || self.services.iter().any(|s| s == service_name);
        service_match && self.starts_at < to && self.ends_at > from
    }
}

/// Why a producer's counts fell short.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GapKind {
    /// Covered by a configured outage window.
    Expected { annotation: String },
    /// Nothing explains it; the missing events get replayed.
    Unexpected,
}

/// Count comparison for one producer over the reconcile window.
#[derive(Debug, Clone)]
pub struct GapReport {
    pub service_name: String,
    pub stage: Stage,
    /// Distinct articles per the producer's audit trail.
    pub expected: u64,
    /// Distinct articles per the event store.
    pub actual: u64,
    /// `None` when the store is not behind the audit trail.
    pub gap: Option<GapKind>,
}

/// Classify a count shortfall against the configured outage windows.
pub fn classify_gap(
    producer: &ProducerConfig,
    expected: u64,
    actual: u64,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    outages: &[OutageWindow],
) -> GapReport {
    let gap = if actual >= expected {
        None
    } else if let Some(outage) = outages
        .iter()
        .find(|o| o.covers(&producer.service_name, from, to))
    {
        Some(GapKind::Expected {
            annotation: outage.annotation.clone(),
        })
    } else {
        Some(GapKind::Unexpected)
    };

    GapReport {
        service_name: producer.service_name.clone(),
        stage: producer.stage,
        expected,
        actual,
        gap,
    }
}

/// Audit rows whose URLs the store has no event for. These become the
/// replay plan, in audit order.
pub fn plan_replay(audit_rows: Vec<AuditRow>, stored_urls: &HashSet<String>) -> Vec<AuditRow> {
    audit_rows
        .into_iter()
        .filter(|row| !stored_urls.contains(&row.article_url))
        .collect()
}

/// Result of reconciling one producer.
#[derive(Debug, Clone)]
pub struct ProducerOutcome {
    pub report: GapReport,
    /// Events re-emitted (0 on dry runs and expected gaps).
    pub replayed: usize,
}

/// The reconciliation engine.
pub struct Reconciler {
    store: EventStore,
    emitter: EmitClient,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(store: EventStore, emitter: EmitClient, config: ReconcileConfig) -> Self {
        Self {
            store,
            emitter,
            config,
        }
    }

    /// Reconcile every configured producer over `[from, to)`.
    ///
    /// With `dry_run` the replay plan is logged but nothing is emitted.
    pub async fn run(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<Vec<ProducerOutcome>> {
        gauge!("reconcile_running").set(1.0);
        let result = self.run_inner(from, to, dry_run).await;
        gauge!("reconcile_running").set(0.0);
        result
    }

    async fn run_inner(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<Vec<ProducerOutcome>> {
        let mut outcomes = Vec::with_capacity(self.config.producers.len());

        for producer in &self.config.producers {
            let reader = AuditReader::open(&producer.audit_db)?;
            let expected = reader.distinct_article_count(from, to)?;
            let actual = self
                .store
                .distinct_article_count(&producer.service_name, producer.stage, from, to)
                .await?;

            let report = classify_gap(producer, expected, actual, from, to, &self.config.outages);

            let replayed = match &report.gap {
                None => {
                    info!(
                        service = %producer.service_name,
                        stage = %producer.stage,
                        expected,
                        actual,
                        "no gap"
                    );
                    0
                }
                Some(GapKind::Expected { annotation }) => {
                    counter!("reconcile_gaps_expected_total").increment(1);
                    info!(
                        service = %producer.service_name,
                        stage = %producer.stage,
                        expected,
                        actual,
                        annotation,
                        "gap covered by outage window"
                    );
                    0
                }
                Some(GapKind::Unexpected) => {
                    counter!("reconcile_gaps_unexpected_total").increment(1);
                    warn!(
                        service = %producer.service_name,
                        stage = %producer.stage,
                        expected,
                        actual,
                        "unexpected gap, building replay plan"
                    );
                    self.replay(producer, &reader, from, to, dry_run).await?
                }
            };

            outcomes.push(ProducerOutcome { report, replayed });
        }

        Ok(outcomes)
    }

    async fn replay(
        &self,
        producer: &ProducerConfig,
        reader: &AuditReader,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<usize> {
        let stored: HashSet<String> = self
            .store
            .article_urls(&producer.service_name, producer.stage, from, to)
            .await?
            .into_iter()
            .collect();

        let plan = plan_replay(reader.rows_in_window(from, to)?, &stored);

        if dry_run {
            for row in &plan {
                info!(
                    service = %producer.service_name,
                    stage = %producer.stage,
                    url = %row.article_url,
                    occurred_at = %row.occurred_at,
                    "would replay (dry run)"
                );
            }
            info!(
                service = %producer.service_name,
                planned = plan.len(),
                "dry run, nothing emitted"
            );
            return Ok(0);
        }

        let mut replayed = 0usize;
        for chunk in plan.chunks(REPLAY_BATCH) {
            let drafts = chunk
                .iter()
                .map(|row| backfill_draft(row, producer))
                .collect();
            match self.emitter.emit_batch(drafts).await {
                Ok(BatchOutcome::Sent(receipt)) => {
                    // A 2xx reply can still reject individual events; only
                    // count what the store now holds.
                    if receipt.invalid > 0 {
                        warn!(
                            service = %producer.service_name,
                            invalid = receipt.invalid,
                            "replay events rejected by ingest validation"
                        );
                    }
                    replayed += receipt.accepted();
                    counter!("reconcile_events_replayed_total")
                        .increment(receipt.accepted() as u64);
                }
                Ok(outcome) => {
                    warn!(?outcome, "replay batch not sent, stopping this producer");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "replay batch failed, stopping this producer");
                    break;
                }
            }
        }

        info!(
            service = %producer.service_name,
            replayed,
            "replay finished"
        );
        Ok(replayed)
    }
}

/// Build the replay event for one missing audit row.
///
/// The draft is attributed to the gapped producer, not to the reconcile
/// job: the gap comparison filters on the producer's service name, so a
/// replay under any other name would never close the gap.
fn backfill_draft(row: &AuditRow, producer: &ProducerConfig) -> pipetrace_core::EventDraft {
    let mut metadata = Map::new();
    metadata.insert("backfilled".to_string(), Value::Bool(true));
    pipetrace_core::EventDraft {
        article_url: row.article_url.clone(),
        source_name: row.source_name.clone(),
        stage: producer.stage,
        service_name: Some(producer.service_name.clone()),
        occurred_at: Some(row.occurred_at),
        idempotency_key: None,
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn producer() -> ProducerConfig {
        ProducerConfig {
            service_name: "crawler".to_string(),
            stage: Stage::Crawled,
            audit_db: PathBuf::from("/var/lib/crawler/audit.db"),
        }
    }

    fn outage(services: &[&str]) -> OutageWindow {
        OutageWindow {
            starts_at: utc("2026-02-10T02:00:00Z"),
            ends_at: utc("2026-02-10T04:00:00Z"),
            annotation: "planned clickhouse upgrade".to_string(),
            services: services.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_no_gap_when_counts_match() {
        let report = classify_gap(
            &producer(),
            100,
            100,
            utc("2026-02-10T00:00:00Z"),
            utc("2026-02-11T00:00:00Z"),
            &[outage(&[])],
        );
        assert!(report.gap.is_none());
    }

    #[test]
    fn test_store_ahead_is_not_a_gap() {
        // Backfilled events can put the store ahead of a truncated audit DB.
        let report = classify_gap(
            &producer(),
            90,
            100,
            utc("2026-02-10T00:00:00Z"),
            utc("2026-02-11T00:00:00Z"),
            &[],
        );
        assert!(report.gap.is_none());
    }

    #[test]
    fn test_gap_inside_outage_is_expected() {
        let report = classify_gap(
            &producer(),
            100,
            80,
            utc("2026-02-10T00:00:00Z"),
            utc("2026-02-11T00:00:00Z"),
            &[outage(&[])],
        );
        assert_eq!(
            report.gap,
            Some(GapKind::Expected {
                annotation: "planned clickhouse upgrade".to_string()
            })
        );
    }

    #[test]
    fn test_outage_for_other_service_does_not_cover() {
        let report = classify_gap(
            &producer(),
            100,
            80,
            utc("2026-02-10T00:00:00Z"),
            utc("2026-02-11T00:00:00Z"),
            &[outage(&["classifier"])],
        );
        assert_eq!(report.gap, Some(GapKind::Unexpected));
    }

    #[test]
    fn test_outage_outside_window_does_not_cover() {
        let report = classify_gap(
            &producer(),
            100,
            80,
            utc("2026-02-11T00:00:00Z"),
            utc("2026-02-12T00:00:00Z"),
            &[outage(&[])],
        );
        assert_eq!(report.gap, Some(GapKind::Unexpected));
    }

    #[test]
    fn test_plan_replay_keeps_only_missing_urls() {
        let rows = vec![
            AuditRow {
                article_url: "https://x.test/a".to_string(),
                source_name: "wire".to_string(),
                occurred_at: utc("2026-02-10T09:00:00Z"),
            },
            AuditRow {
                article_url: "https://x.test/b".to_string(),
                source_name: "wire".to_string(),
                occurred_at: utc("2026-02-10T10:00:00Z"),
            },
        ];
        let stored: HashSet<String> = ["https://x.test/a".to_string()].into();

        let plan = plan_replay(rows, &stored);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].article_url, "https://x.test/b");
    }

    #[test]
    fn test_backfill_draft_marks_metadata() {
        let row = AuditRow {
            article_url: "https://x.test/b".to_string(),
            source_name: "wire".to_string(),
            occurred_at: utc("2026-02-10T10:00:00Z"),
        };
        let draft = backfill_draft(&row, &producer());
        assert_eq!(draft.metadata.get("backfilled"), Some(&Value::Bool(true)));
        assert_eq!(draft.occurred_at, Some(row.occurred_at));
        assert_eq!(draft.stage, Stage::Crawled);
    }

    #[test]
    fn test_backfill_draft_attributed_to_producer() {
        // The gap query filters on the producer's service name; a replay
        // attributed to anything else would re-detect the same gap forever.
        let row = AuditRow {
            article_url: "https://x.test/b".to_string(),
            source_name: "wire".to_string(),
            occurred_at: utc("2026-02-10T10:00:00Z"),
        };
        let draft = backfill_draft(&row, &producer());
        assert_eq!(draft.service_name.as_deref(), Some("crawler"));
    }

    #[test]
    fn test_config_from_toml() {
        let config = ReconcileConfig::from_toml(
            r#"
            [[producers]]
            service_name = "crawler"
            stage = "crawled"
            audit_db = "/var/lib/crawler/audit.db"

            [[outages]]
            starts_at = "2026-02-10T02:00:00Z"
            ends_at = "2026-02-10T04:00:00Z"
            annotation = "planned clickhouse upgrade"
            services = ["crawler"]
            "#,
        )
        .unwrap();

        assert_eq!(config.producers.len(), 1);
        assert_eq!(config.producers[0].stage, Stage::Crawled);
        assert_eq!(config.outages.len(), 1);
        assert_eq!(config.outages[0].services, vec!["crawler"]);
    }
}
