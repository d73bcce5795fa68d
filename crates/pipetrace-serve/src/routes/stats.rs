//! Stats report endpoint: volumes, quality, publish failures, throughput.

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};

use pipetrace_ingest::{LatencySummary, ModelVersionRow, VolumeRow};

use crate::cache::get_or_compute;
use crate::error::ApiError;
use crate::routes::funnel::ReportQuery;
use crate::state::AppState;

/// Volume of one source or topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeEntry {
    pub name: String,
    pub events: u64,
    pub unique_articles: u64,
}

impl From<VolumeRow> for VolumeEntry {
    fn from(row: VolumeRow) -> Self {
        Self {
            name: row.name,
            events: row.events,
            unique_articles: row.unique_articles,
        }
    }
}

/// Per-model-version stats. Quality fields are absent when no event in the
/// group carried a score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelVersionEntry {
    pub model_version: String,
    pub events: u64,
    pub unique_articles: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_quality: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub median_quality: Option<f64>,
}

impl From<ModelVersionRow> for ModelVersionEntry {
    fn from(row: ModelVersionRow) -> Self {
        Self {
            model_version: row.model_version,
            events: row.events,
            unique_articles: row.unique_articles,
            avg_quality: quality_opt(row.avg_quality),
            median_quality: quality_opt(row.median_quality),
        }
    }
}

/// Mean/median inter-stage latency in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyEntry {
    pub segment: String,
    pub mean_seconds: f64,
    pub median_seconds: f64,
}

impl From<LatencySummary> for LatencyEntry {
    fn from(s: LatencySummary) -> Self {
        Self {
            segment: s.segment,
            mean_seconds: s.mean_seconds,
            median_seconds: s.median_seconds,
        }
    }
}

/// `GET /stats` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub period: String,
    pub timezone: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub by_source: Vec<VolumeEntry>,
    /// Volumes keyed by article domain, via the articles dimension.
    pub by_domain: Vec<VolumeEntry>,
    pub by_topic: Vec<VolumeEntry>,
    pub by_model_version: Vec<ModelVersionEntry>,
    /// Articles routed in the window that never reached `published`.
    pub publish_failures: u64,
    pub latency: Vec<LatencyEntry>,
    pub generated_at: DateTime<Utc>,
}

/// `GET /stats?period=&source=&tz=`
pub async fn stats(
    State(state): State<AppState>,
    Query(params): Query<ReportQuery>,
) -> Result<Json<StatsResponse>, ApiError> {
    counter!("query_stats_total").increment(1);

    let now = Utc::now();
    let window = params.resolve(now)?;
    let key = params.cache_key("stats");
    let source = params.source.as_deref();

    let response = get_or_compute(&state.cache, &key, || async {
        let by_source = state.store.volume_by_source(&window).await?;
        let by_domain = state.store.volume_by_domain(&window, source).await?;
        let by_topic = state.store.volume_by_topic(&window, source).await?;
        let by_model_version = state.store.model_version_summaries(&window, source).await?;
        let publish_failures = state.store.publish_failures(&window, source).await?;
        let latency = state.store.latency_summaries(&window, source).await?;

        Ok(StatsResponse {
            period: window.period.to_string(),
            timezone: params.tz.clone().unwrap_or_else(|| "UTC".to_string()),
            from: window.from,
            to: window.to,
            by_source: by_source.into_iter().map(Into::into).collect(),
            by_domain: by_domain.into_iter().map(Into::into).collect(),
            by_topic: by_topic.into_iter().map(Into::into).collect(),
            by_model_version: by_model_version.into_iter().map(Into::into).collect(),
            publish_failures,
            latency: latency.into_iter().map(Into::into).collect(),
            generated_at: Utc::now(),
        })
    })
    .await?;

    Ok(Json(response))
}

/// ClickHouse reports empty `avgIf`/`quantileIf` groups as NaN.
pub fn quality_opt(v: f64) -> Option<f64> {
    if v.is_nan() {
        None
    } else {
        Some(v)
    }
}
