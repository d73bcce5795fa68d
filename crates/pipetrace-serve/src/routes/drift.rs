//! Model drift report endpoint.
//!
//! Summarizes each classifier model version seen in the window and compares
//! its topic distribution with the immediately preceding version using total
//! variation distance: `0.5 * sum(|p_i - q_i|)` over the union of topics.
//! A shift of 0.0 means identical distributions, 1.0 means disjoint.

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use pipetrace_ingest::{ModelVersionRow, TopicCountRow};

use crate::cache::get_or_compute;
use crate::error::ApiError;
use crate::routes::funnel::ReportQuery;
use crate::routes::stats::quality_opt;
use crate::state::AppState;

/// Drift summary for one model version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftEntry {
    pub model_version: String,
    pub events: u64,
    pub unique_articles: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_quality: Option<f64>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Whole days since this version was first seen in the window.
    pub age_days: i64,
    /// Topic-distribution shift versus the previous version; absent for the
    /// oldest version in the window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_shift_from_previous: Option<f64>,
}

/// `GET /stats/drift` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftResponse {
    pub period: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Oldest version first, matching comparison order.
    pub model_versions: Vec<DriftEntry>,
    pub generated_at: DateTime<Utc>,
}

/// `GET /stats/drift?period=&source=&tz=`
pub async fn drift(
    State(state): State<AppState>,
    Query(params): Query<ReportQuery>,
) -> Result<Json<DriftResponse>, ApiError> {
    counter!("query_drift_total").increment(1);

    let now = Utc::now();
    let window = params.resolve(now)?;
    let key = params.cache_key("drift");
    let source = params.source.as_deref();

    let response = get_or_compute(&state.cache, &key, || async {
        let versions = state.store.model_version_summaries(&window, source).await?;
        let topics = state.store.topic_counts_by_version(&window, source).await?;
        Ok(build_drift_report(
            window.period.to_string(),
            window.from,
            window.to,
            versions,
            topics,
            now,
        ))
    })
    .await?;

    Ok(Json(response))
}

/// Assemble the drift report from the two store queries.
fn build_drift_report(
    period: String,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    versions: Vec<ModelVersionRow>,
    topics: Vec<TopicCountRow>,
    now: DateTime<Utc>,
) -> DriftResponse {
    let mut by_version: HashMap<String, BTreeMap<String, u64>> = HashMap::new();
    for row in topics {
        by_version
            .entry(row.model_version)
            .or_default()
            .insert(row.topic, row.count);
    }

    let mut entries = Vec::with_capacity(versions.len());
    let mut previous: Option<&BTreeMap<String, u64>> = None;
    let empty = BTreeMap::new();

    // versions arrive oldest first, so "previous" is the predecessor.
    for row in &versions {
        let current = by_version.get(&row.model_version).unwrap_or(&empty);
        let shift = previous.map(|prev| total_variation(prev, current));
        previous = Some(current);

        let first_seen = DateTime::from_timestamp(i64::from(row.first_seen), 0)
            .unwrap_or_default();
        let last_seen = DateTime::from_timestamp(i64::from(row.last_seen), 0)
            .unwrap_or_default();

        entries.push(DriftEntry {
            model_version: row.model_version.clone(),
            events: row.events,
            unique_articles: row.unique_articles,
            avg_quality: quality_opt(row.avg_quality),
            first_seen,
            last_seen,
            age_days: (now - first_seen).num_days(),
            topic_shift_from_previous: shift,
        });
    }

    DriftResponse {
        period,
        from,
        to,
        model_versions: entries,
        generated_at: Utc::now(),
    }
}

/// Total variation distance between two topic count distributions.
fn total_variation(a: &BTreeMap<String, u64>, b: &BTreeMap<String, u64>) -> f64 {
    let total_a: u64 = a.values().sum();
    let total_b: u64 = b.values().sum();
    if total_a == 0 || total_b == 0 {
        // No distribution to compare against.
        return 0.0;
    }

    let mut distance = 0.0;
    let topics: std::collections::BTreeSet<&String> = a.keys().chain(b.keys()).collect();
    for topic in topics {
        let p = *a.get(topic).unwrap_or(&0) as f64 / total_a as f64;
        let q = *b.get(topic).unwrap_or(&0) as f64 / total_b as f64;
        distance += (p - q).abs();
    }
    distance / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics(pairs: &[(&str, u64)]) -> BTreeMap<String, u64> {
        pairs.iter().map(|(t, c)| (t.to_string(), *c)).collect()
    }

    fn version(name: &str, first_seen: u32) -> ModelVersionRow {
        ModelVersionRow {
            model_version: name.to_string(),
            events: 100,
            unique_articles: 90,
            avg_quality: 0.8,
            median_quality: 0.8,
            first_seen,
            last_seen: first_seen + 3600,
        }
    }

    #[test]
    fn test_total_variation_identical() {
        let a = topics(&[("politics", 50), ("sports", 50)]);
        assert_eq!(total_variation(&a, &a), 0.0);
    }

    #[test]
    fn test_total_variation_disjoint() {
        let a = topics(&[("politics", 100)]);
        let b = topics(&[("sports", 100)]);
        assert_eq!(total_variation(&a, &b), 1.0);
    }

    #[test]
    fn test_total_variation_partial_shift() {
        // 60/40 vs 40/60: |0.6-0.4| + |0.4-0.6| = 0.4, halved = 0.2.
        let a = topics(&[("politics", 60), ("sports", 40)]);
        let b = topics(&[("politics", 40), ("sports", 60)]);
        let tv = total_variation(&a, &b);
        assert!((tv - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_total_variation_empty_side() {
        let a = topics(&[("politics", 10)]);
        assert_eq!(total_variation(&a, &BTreeMap::new()), 0.0);
    }

    #[test]
    fn test_build_drift_report_pairs_versions() {
        let now: DateTime<Utc> = "2026-02-10T12:00:00Z".parse().unwrap();
        let v1_seen = 1770000000u32; // well before now
        let versions = vec![version("v1", v1_seen), version("v2", v1_seen + 86_400)];
        let topic_rows = vec![
            TopicCountRow {
                model_version: "v1".to_string(),
                topic: "politics".to_string(),
                count: 100,
            },
            TopicCountRow {
                model_version: "v2".to_string(),
                topic: "sports".to_string(),
                count: 100,
            },
        ];

        let report = build_drift_report(
            "7d".to_string(),
            now - chrono::Duration::days(7),
            now,
            versions,
            topic_rows,
            now,
        );

        assert_eq!(report.model_versions.len(), 2);
        // Oldest version has no predecessor.
        assert_eq!(report.model_versions[0].topic_shift_from_previous, None);
        // Disjoint topics: maximal shift.
        assert_eq!(
            report.model_versions[1].topic_shift_from_previous,
            Some(1.0)
        );
        assert!(report.model_versions[0].age_days >= 0);
    }

    #[test]
    fn test_build_drift_report_version_without_topics() {
        let now: DateTime<Utc> = "2026-02-10T12:00:00Z".parse().unwrap();
        let versions = vec![version("v1", 1770000000), version("v2", 1770086400)];

        // No topic rows at all: shift against an empty distribution is 0.
        let report =
            build_drift_report("24h".to_string(), now, now, versions, Vec::new(), now);
        assert_eq!(
            report.model_versions[1].topic_shift_from_previous,
            Some(0.0)
        );
    }
}
