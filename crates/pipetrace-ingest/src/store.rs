//! The ClickHouse event store.
//!
//! [`EventStore`] owns the write path (article upsert, event insert with
//! synchronous duplicate detection) and the aggregate read path (funnel,
//! stats, throughput, drift inputs). Events are immutable once written;
//! the only delete is whole-partition retention.

use chrono::{DateTime, Utc};
use clickhouse::{Client, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use pipetrace_core::{
    metadata_f64, metadata_str, url_hash, Article, PipelineEvent, Stage, TimeWindow,
    LATENCY_SEGMENTS,
};

use crate::dedupe::IdempotencyIndex;
use crate::error::Result;
use crate::schema;

/// Outcome of inserting a single event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new fact was written.
    Inserted,
    /// The `(idempotency_key, occurred_at)` pair was already accepted;
    /// nothing was written.
    Duplicate,
}

/// Row shape for the `articles` table. Field order matches the DDL.
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
struct ArticleRow {
    url: String,
    url_hash: String,
    domain: String,
    source_name: String,
    first_seen_at: u32, // DateTime is stored as Unix timestamp
}

impl From<&Article> for ArticleRow {
    fn from(a: &Article) -> Self {
        Self {
            url: a.url.clone(),
            url_hash: a.url_hash.clone(),
            domain: a.domain.clone(),
            source_name: a.source_name.clone(),
            first_seen_at: a.first_seen_at.timestamp() as u32,
        }
    }
}

/// Row shape for the `pipeline_events` table. Field order matches the DDL.
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
struct EventRow {
    article_url: String,
    url_hash: String,
    stage: String,
    occurred_at: u32,
    received_at: u32,
    service_name: String,
    source_name: String,
    model_version: String,
    topic: String,
    quality: f64,
    has_quality: u8,
    backfilled: u8,
    metadata: String,
    metadata_schema_version: u16,
    idempotency_key: String,
}

impl EventRow {
    fn from_event(event: &PipelineEvent) -> Self {
        let quality = metadata_f64(&event.metadata, "quality");
        let backfilled = event
            .metadata
            .get("backfilled")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        Self {
            article_url: event.article_url.clone(),
            url_hash: url_hash(&event.article_url),
            stage: event.stage.as_str().to_string(),
            occurred_at: event.occurred_at.timestamp() as u32,
            received_at: event.received_at.timestamp() as u32,
            service_name: event.service_name.clone(),
            source_name: event.source_name.clone(),
            model_version: metadata_str(&event.metadata, "model_version")
                .unwrap_or_default()
                .to_string(),
            topic: metadata_str(&event.metadata, "topic").unwrap_or_default().to_string(),
            quality: quality.unwrap_or(0.0),
            has_quality: u8::from(quality.is_some()),
            backfilled: u8::from(backfilled),
            metadata: serde_json::Value::Object(event.metadata.clone()).to_string(),
            metadata_schema_version: event.metadata_schema_version,
            idempotency_key: event.idempotency_key.clone(),
        }
    }
}

/// Per-stage funnel counts.
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct FunnelRow {
    pub stage: String,
    pub count: u64,
    pub unique_articles: u64,
}

/// Event volume grouped by one dimension (source or topic).
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct VolumeRow {
    pub name: String,
    pub events: u64,
    pub unique_articles: u64,
}

/// Per-model-version summary over classification events.
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct ModelVersionRow {
    pub model_version: String,
    pub events: u64,
    pub unique_articles: u64,
    /// NaN when no event in the group carried a quality score.
    pub avg_quality: f64,
    pub median_quality: f64,
    /// Unix seconds of the earliest classification under this version.
    pub first_seen: u32,
    pub last_seen: u32,
}

/// Topic share of one model version's classifications.
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct TopicCountRow {
    pub model_version: String,
    pub topic: String,
    pub count: u64,
}

/// Mean and median delta for one latency segment, in seconds.
#[derive(Debug, Clone, Serialize)]
pub struct LatencySummary {
    pub segment: String,
    pub mean_seconds: f64,
    pub median_seconds: f64,
}

#[derive(Debug, Row, Deserialize)]
struct LatencyRow {
    mean: f64,
    median: f64,
}

#[derive(Debug, Row, Deserialize)]
struct CountRow {
    count: u64,
}

#[derive(Debug, Row, Deserialize)]
struct UrlRow {
    article_url: String,
}

/// The event store: ClickHouse for facts, RocksDB for synchronous dedupe.
///
/// The index is only held by the writing process (the API server); readers
/// like the reconcile and retention binaries open the store without one.
#[derive(Clone)]
pub struct EventStore {
    client: Client,
    index: Option<Arc<IdempotencyIndex>>,
}

impl EventStore {
    /// Build a writable store over an existing ClickHouse client.
    pub fn new(client: Client, index: Arc<IdempotencyIndex>) -> Self {
        Self {
            client,
            index: Some(index),
        }
    }

    /// Connect to ClickHouse with the idempotency index for writes.
    pub fn connect(url: &str, database: &str, index: Arc<IdempotencyIndex>) -> Self {
        Self::new(Self::make_client(url, database), index)
    }

    /// Connect read-only; insert calls fail. The RocksDB index is
    /// single-process, so only the API server opens it.
    pub fn connect_read_only(url: &str, database: &str) -> Self {
        Self {
            client: Self::make_client(url, database),
            index: None,
        }
    }

    fn make_client(url: &str, database: &str) -> Client {
        Client::default().with_url(url).with_database(database)
    }

    /// Create tables if they do not exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        schema::ensure_schema(&self.client).await
    }

    /// Check that ClickHouse is reachable.
    pub async fn ping(&self) -> Result<()> {
        let one: u8 = self.client.query("SELECT 1").fetch_one().await?;
        debug_assert_eq!(one, 1);
        Ok(())
    }

    /// Insert one event, deduplicating on `(idempotency_key, occurred_at)`.
    ///
    /// On first sight of the article URL its `articles` row is written too,
    /// with `first_seen_at` taken from this event's `occurred_at`.
    pub async fn insert_event(&self, event: &PipelineEvent) -> Result<InsertOutcome> {
        let mut outcomes = self.insert_batch(std::slice::from_ref(event)).await?;
        // insert_batch returns exactly one outcome per input event
        Ok(outcomes.pop().unwrap_or(InsertOutcome::Duplicate))
    }

    /// Insert a batch of events with per-event outcomes.
    ///
    /// Duplicates inside the batch and against history are skipped without
    /// failing the rest; there is no rollback. Index marks land only after
    /// ClickHouse accepted the rows, so a failed insert leaves every event
    /// in the batch retriable instead of stranded as a phantom duplicate.
    pub async fn insert_batch(&self, events: &[PipelineEvent]) -> Result<Vec<InsertOutcome>> {
        let index = self
            .index
            .as_ref()
            .ok_or_else(|| crate::error::Error::Config("event store is read-only".to_string()))?;

        let plan = plan_batch(index, events)?;

        if !plan.article_rows.is_empty() {
            let mut inserter = self.client.insert("articles")?;
            for row in &plan.article_rows {
                inserter.write(row).await?;
            }
            inserter.end().await?;
            metrics::counter!("ingest_articles_created_total")
                .increment(plan.article_rows.len() as u64);
        }

        if !plan.event_rows.is_empty() {
            let mut inserter = self.client.insert("pipeline_events")?;
            for row in &plan.event_rows {
                inserter.write(row).await?;
            }
            inserter.end().await?;
        }

        for (key, occurred_at) in &plan.event_marks {
            index.mark_event(key, *occurred_at)?;
        }
        for row in &plan.article_rows {
            index.mark_article(&row.url_hash)?;
        }

        Ok(plan.outcomes)
    }

    /// Per-stage counts for the funnel. Stages with no events in the window
    /// are absent from the result; the API layer zero-fills them.
    pub async fn funnel_counts(
        &self,
        window: &TimeWindow,
        source: Option<&str>,
    ) -> Result<Vec<FunnelRow>> {
        let query = format!(
            "SELECT
                stage,
                count() AS count,
                uniqExact(url_hash) AS unique_articles
            FROM pipeline_events
            WHERE occurred_at >= toDateTime(?) AND occurred_at < toDateTime(?)
            {}
            GROUP BY stage",
            source_clause(source)
        );

        let rows = bind_window_and_source(self.client.query(&query), window, source)
            .fetch_all()
            .await?;
        Ok(rows)
    }

    /// Event volume grouped by source.
    pub async fn volume_by_source(&self, window: &TimeWindow) -> Result<Vec<VolumeRow>> {
        let rows = bind_window(
            self.client.query(
                "SELECT
                    source_name AS name,
                    count() AS events,
                    uniqExact(url_hash) AS unique_articles
                FROM pipeline_events
                WHERE occurred_at >= toDateTime(?) AND occurred_at < toDateTime(?)
                GROUP BY name
                ORDER BY events DESC",
            ),
            window,
        )
        .fetch_all()
        .await?;
        Ok(rows)
    }

    /// Event volume grouped by article domain.
    ///
    /// Domains come from the `articles` dimension; pre-merge duplicate
    /// article rows are collapsed with `any(domain)` before the join.
    pub async fn volume_by_domain(
        &self,
        window: &TimeWindow,
        source: Option<&str>,
    ) -> Result<Vec<VolumeRow>> {
        let query = format!(
            "SELECT
                a.domain AS name,
                count() AS events,
                uniqExact(e.url_hash) AS unique_articles
            FROM pipeline_events AS e
            INNER JOIN (
                SELECT url_hash, any(domain) AS domain
                FROM articles
                GROUP BY url_hash
            ) AS a ON a.url_hash = e.url_hash
            WHERE e.occurred_at >= toDateTime(?) AND e.occurred_at < toDateTime(?)
            {}
            GROUP BY name
            ORDER BY events DESC",
            source_clause(source)
        );

        let rows = bind_window_and_source(self.client.query(&query), window, source)
            .fetch_all()
            .await?;
        Ok(rows)
    }

    /// Classification volume grouped by topic.
    pub async fn volume_by_topic(
        &self,
        window: &TimeWindow,
        source: Option<&str>,
    ) -> Result<Vec<VolumeRow>> {
        let query = format!(
            "SELECT
                topic AS name,
                count() AS events,
                uniqExact(url_hash) AS unique_articles
            FROM pipeline_events
            WHERE stage = 'classified' AND topic != ''
                AND occurred_at >= toDateTime(?) AND occurred_at < toDateTime(?)
            {}
            GROUP BY name
            ORDER BY events DESC",
            source_clause(source)
        );

        let rows = bind_window_and_source(self.client.query(&query), window, source)
            .fetch_all()
            .await?;
        Ok(rows)
    }

    /// Per-model-version summaries over classification events, oldest
    /// version first.
    pub async fn model_version_summaries(
        &self,
        window: &TimeWindow,
        source: Option<&str>,
    ) -> Result<Vec<ModelVersionRow>> {
        let query = format!(
            "SELECT
                model_version,
                count() AS events,
                uniqExact(url_hash) AS unique_articles,
                avgIf(quality, has_quality = 1) AS avg_quality,
                quantileIf(0.5)(quality, has_quality = 1) AS median_quality,
                toUInt32(min(occurred_at)) AS first_seen,
                toUInt32(max(occurred_at)) AS last_seen
            FROM pipeline_events
            WHERE stage = 'classified' AND model_version != ''
                AND occurred_at >= toDateTime(?) AND occurred_at < toDateTime(?)
            {}
            GROUP BY model_version
            ORDER BY first_seen ASC",
            source_clause(source)
        );

        let rows = bind_window_and_source(self.client.query(&query), window, source)
            .fetch_all()
            .await?;
        Ok(rows)
    }

    /// Topic counts per model version, the input to the drift comparison.
    pub async fn topic_counts_by_version(
        &self,
        window: &TimeWindow,
        source: Option<&str>,
    ) -> Result<Vec<TopicCountRow>> {
        let query = format!(
            "SELECT
                model_version,
                topic,
                count() AS count
            FROM pipeline_events
            WHERE stage = 'classified' AND model_version != ''
                AND occurred_at >= toDateTime(?) AND occurred_at < toDateTime(?)
            {}
            GROUP BY model_version, topic",
            source_clause(source)
        );

        let rows = bind_window_and_source(self.client.query(&query), window, source)
            .fetch_all()
            .await?;
        Ok(rows)
    }

    /// Articles routed in the window that never reached `published`.
    pub async fn publish_failures(
        &self,
        window: &TimeWindow,
        source: Option<&str>,
    ) -> Result<u64> {
        let query = format!(
            "SELECT toUInt64(countIf(published = 0)) AS count
            FROM (
                SELECT
                    url_hash,
                    countIf(stage = 'routed') AS routed,
                    countIf(stage = 'published') AS published
                FROM pipeline_events
                WHERE occurred_at >= toDateTime(?) AND occurred_at < toDateTime(?)
                {}
                GROUP BY url_hash
                HAVING routed > 0
            )",
            source_clause(source)
        );

        let row: CountRow = bind_window_and_source(self.client.query(&query), window, source)
            .fetch_one()
            .await?;
        Ok(row.count)
    }

    /// Mean and median inter-stage latency per segment, in seconds.
    ///
    /// Each article contributes its earliest occurrence per stage; an article
    /// only counts toward a segment when it reached both endpoints in the
    /// window. Negative deltas (reordered timestamps) clamp to zero. Segments
    /// with no qualifying article come back as NaN from ClickHouse and are
    /// reported as zero.
    pub async fn latency_summaries(
        &self,
        window: &TimeWindow,
        source: Option<&str>,
    ) -> Result<Vec<LatencySummary>> {
        let mins: Vec<String> = Stage::ALL
            .iter()
            .map(|s| {
                format!(
                    "minIf(toUnixTimestamp(occurred_at), stage = '{s}') AS t_{s}",
                    s = s.as_str()
                )
            })
            .collect();

        let mut summaries = Vec::with_capacity(LATENCY_SEGMENTS.len());
        for (segment, from, to) in LATENCY_SEGMENTS {
            let query = format!(
                "SELECT
                    avgIf(delta, ok) AS mean,
                    quantileIf(0.5)(delta, ok) AS median
                FROM (
                    SELECT
                        greatest(0, toInt64(t_{to}) - toInt64(t_{from})) AS delta,
                        t_{from} > 0 AND t_{to} > 0 AS ok
                    FROM (
                        SELECT url_hash, {mins}
                        FROM pipeline_events
                        WHERE occurred_at >= toDateTime(?) AND occurred_at < toDateTime(?)
                        {source}
                        GROUP BY url_hash
                    )
                )",
                from = from.as_str(),
                to = to.as_str(),
                mins = mins.join(", "),
                source = source_clause(source),
            );

            let row: LatencyRow = bind_window_and_source(self.client.query(&query), window, source)
                .fetch_one()
                .await?;

            summaries.push(LatencySummary {
                segment: segment.to_string(),
                mean_seconds: zero_if_nan(row.mean),
                median_seconds: zero_if_nan(row.median),
            });
        }

        Ok(summaries)
    }

    /// Count of distinct articles a producer reported in the window.
    pub async fn distinct_article_count(
        &self,
        service_name: &str,
        stage: Stage,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64> {
        let row: CountRow = self
            .client
            .query(
                "SELECT toUInt64(uniqExact(url_hash)) AS count
                FROM pipeline_events
                WHERE service_name = ? AND stage = ?
                    AND occurred_at >= toDateTime(?) AND occurred_at < toDateTime(?)",
            )
            .bind(service_name)
            .bind(stage.as_str())
            .bind(from.timestamp())
            .bind(to.timestamp())
            .fetch_one()
            .await?;
        Ok(row.count)
    }

    /// Distinct article URLs a producer reported in the window. Used by
    /// reconciliation to find what the audit trail has and the store lacks.
    pub async fn article_urls(
        &self,
        service_name: &str,
        stage: Stage,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let rows: Vec<UrlRow> = self
            .client
            .query(
                "SELECT DISTINCT article_url
                FROM pipeline_events
                WHERE service_name = ? AND stage = ?
                    AND occurred_at >= toDateTime(?) AND occurred_at < toDateTime(?)",
            )
            .bind(service_name)
            .bind(stage.as_str())
            .bind(from.timestamp())
            .bind(to.timestamp())
            .fetch_all()
            .await?;
        Ok(rows.into_iter().map(|r| r.article_url).collect())
    }

    /// The underlying client, for partition management.
    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Rows and index marks for one batch, computed before anything is written.
struct BatchPlan {
    outcomes: Vec<InsertOutcome>,
    event_rows: Vec<EventRow>,
    article_rows: Vec<ArticleRow>,
    event_marks: Vec<(String, DateTime<Utc>)>,
}

/// Resolve a batch against the index and against itself without marking
/// anything. Marks are applied by the caller after the insert succeeds.
fn plan_batch(index: &IdempotencyIndex, events: &[PipelineEvent]) -> Result<BatchPlan> {
    let mut plan = BatchPlan {
        outcomes: Vec::with_capacity(events.len()),
        event_rows: Vec::new(),
        article_rows: Vec::new(),
        event_marks: Vec::new(),
    };
    let mut batch_events: HashSet<(String, DateTime<Utc>)> = HashSet::new();
    let mut batch_articles: HashSet<String> = HashSet::new();

    for event in events {
        let identity = (event.idempotency_key.clone(), event.occurred_at);
        if batch_events.contains(&identity)
            || index.has_event(&event.idempotency_key, event.occurred_at)?
        {
            plan.outcomes.push(InsertOutcome::Duplicate);
            continue;
        }
        batch_events.insert(identity.clone());

        let row = EventRow::from_event(event);
        if !batch_articles.contains(&row.url_hash) && !index.has_article(&row.url_hash)? {
            batch_articles.insert(row.url_hash.clone());
            let article =
                Article::from_event(&event.article_url, &event.source_name, event.occurred_at);
            plan.article_rows.push(ArticleRow::from(&article));
        }
        plan.event_marks.push(identity);
        plan.event_rows.push(row);
        plan.outcomes.push(InsertOutcome::Inserted);
    }

    Ok(plan)
}

fn source_clause(source: Option<&str>) -> &'static str {
    if source.is_some() {
        "AND source_name = ?"
    } else {
        ""
    }
}

fn bind_window(query: clickhouse::query::Query, window: &TimeWindow) -> clickhouse::query::Query {
    query
        .bind(window.from.timestamp())
        .bind(window.to.timestamp())
}

fn bind_window_and_source(
    query: clickhouse::query::Query,
    window: &TimeWindow,
    source: Option<&str>,
) -> clickhouse::query::Query {
    let query = bind_window(query, window);
    match source {
        Some(s) => query.bind(s),
        None => query,
    }
}

fn zero_if_nan(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v
    }
}
