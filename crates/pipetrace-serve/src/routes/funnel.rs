//! Funnel report endpoint.

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};

use pipetrace_core::{parse_timezone, Period, Stage, TimeWindow};
use pipetrace_ingest::FunnelRow;

use crate::cache::get_or_compute;
use crate::error::ApiError;
use crate::state::AppState;

/// Query parameters shared by the aggregate report endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportQuery {
    /// Reporting period: `today`, `24h`, `7d`, `30d`. Defaults to `24h`.
    pub period: Option<String>,
    /// Filter to one source.
    pub source: Option<String>,
    /// `UTC` or a fixed offset such as `+05:00`; only affects `today`.
    pub tz: Option<String>,
}

impl ReportQuery {
    /// Resolve period and timezone, or reject with a 400.
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<TimeWindow, ApiError> {
        let period: Period = self.period.as_deref().unwrap_or("24h").parse()?;
        let tz = parse_timezone(self.tz.as_deref())?;
        Ok(TimeWindow::resolve(period, now, tz))
    }

    /// Cache key fragment covering every parameter that affects the result.
    pub fn cache_key(&self, endpoint: &str) -> String {
        format!(
            "{}:{}:{}:{}",
            endpoint,
            self.period.as_deref().unwrap_or("24h"),
            self.source.as_deref().unwrap_or("all"),
            self.tz.as_deref().unwrap_or("UTC"),
        )
    }
}

/// One stage of the funnel, in pipeline order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageFunnel {
    pub stage: Stage,
    pub count: u64,
    pub unique_articles: u64,
}

/// `GET /funnel` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelResponse {
    pub period: String,
    pub timezone: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub stages: Vec<StageFunnel>,
    pub generated_at: DateTime<Utc>,
}

/// `GET /funnel?period=&source=&tz=`
///
/// Per-stage event and unique-article counts in pipeline order. Stages with
/// no events in the window are present with zeros.
pub async fn funnel(
    State(state): State<AppState>,
    Query(params): Query<ReportQuery>,
) -> Result<Json<FunnelResponse>, ApiError> {
    counter!("query_funnel_total").increment(1);

    let now = Utc::now();
    let window = params.resolve(now)?;
    let key = params.cache_key("funnel");

    let response = get_or_compute(&state.cache, &key, || async {
        let rows = state
            .store
            .funnel_counts(&window, params.source.as_deref())
            .await?;
        Ok(FunnelResponse {
            period: window.period.to_string(),
            timezone: params.tz.clone().unwrap_or_else(|| "UTC".to_string()),
            from: window.from,
            to: window.to,
            stages: assemble_funnel(rows),
            generated_at: Utc::now(),
        })
    })
    .await?;

    Ok(Json(response))
}

/// Order rows by pipeline position, zero-filling silent stages.
fn assemble_funnel(rows: Vec<FunnelRow>) -> Vec<StageFunnel> {
    Stage::ALL
        .iter()
        .map(|&stage| {
            let row = rows.iter().find(|r| r.stage == stage.as_str());
            StageFunnel {
                stage,
                count: row.map_or(0, |r| r.count),
                unique_articles: row.map_or(0, |r| r.unique_articles),
            }
        })
        .collect()
}
