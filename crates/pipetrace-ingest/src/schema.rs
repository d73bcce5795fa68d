//! ClickHouse schema bootstrap.
//!
//! [`ensure_schema`] runs at process startup and creates every table the
//! store needs, idempotently. There is no separate migration tool; DDL is
//! `IF NOT EXISTS` and additive.
//!
//! # Layout
//!
//! - `articles`: one row per tracked URL, ReplacingMergeTree keyed by
//!   `url_hash`. The idempotency index gates first-insert, so duplicate rows
//!   only arise from crash races and collapse at merge; readers take
//!   `min(first_seen_at)` / `any(domain)`.
//! - `pipeline_events`: the append-only fact table. Partitioned by month of
//!   `occurred_at` so retention can drop whole partitions; ordered by
//!   `(stage, occurred_at, idempotency_key)` which both covers funnel scans
//!   and makes the ReplacingMergeTree key the store-level duplicate
//!   backstop. A bloom-filter skip index on `url_hash` serves per-article
//!   lookups.
//!
//! Columns extracted from metadata at ingest time (`model_version`, `topic`,
//! `quality`, `backfilled`) are what keep the stats and drift SQL cheap; the
//! raw metadata JSON rides along for anything not promoted to a column.

use clickhouse::Client;
use tracing::info;

use crate::error::Result;

const CREATE_ARTICLES: &str = "
CREATE TABLE IF NOT EXISTS articles
(
    url           String,
    url_hash      String,
    domain        LowCardinality(String),
    source_name   LowCardinality(String),
    first_seen_at DateTime
)
ENGINE = ReplacingMergeTree
ORDER BY url_hash";

const CREATE_PIPELINE_EVENTS: &str = "
CREATE TABLE IF NOT EXISTS pipeline_events
(
    article_url             String,
    url_hash                String,
    stage                   LowCardinality(String),
    occurred_at             DateTime,
    received_at             DateTime,
    service_name            LowCardinality(String),
    source_name             LowCardinality(String),
    model_version           LowCardinality(String),
    topic                   LowCardinality(String),
    quality                 Float64,
    has_quality             UInt8,
    backfilled              UInt8,
    metadata                String,
    metadata_schema_version UInt16,
    idempotency_key         String,
    INDEX idx_url_hash url_hash TYPE bloom_filter(0.01) GRANULARITY 4
)
ENGINE = ReplacingMergeTree
PARTITION BY toYYYYMM(occurred_at)
ORDER BY (stage, occurred_at, idempotency_key)";

/// Create all tables if they do not exist.
pub async fn ensure_schema(client: &Client) -> Result<()> {
    client.query(CREATE_ARTICLES).execute().await?;
    client.query(CREATE_PIPELINE_EVENTS).execute().await?;
    info!("ClickHouse schema ensured");
    Ok(())
}
