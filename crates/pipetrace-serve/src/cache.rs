//! In-memory response caching with moka.
//!
//! Aggregate reports (funnel, stats, drift) are expensive ClickHouse scans
//! that many dashboards poll; each is cached by its full parameter set.
//! Responses carry a `generated_at` field that is serialized into the cached
//! JSON, so a cached reply is visibly stale rather than silently fresh.

use std::future::Future;
use std::time::Duration;

use moka::future::Cache;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::ApiError;

/// Cache capacity (number of entries).
pub const CACHE_CAPACITY: u64 = 1000;

/// TTL for aggregate reports.
pub const REPORT_TTL: Duration = Duration::from_secs(60);

/// Cached response with metadata.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    /// Serialized JSON response.
    pub json: String,
    /// When this entry was cached.
    pub cached_at: chrono::DateTime<chrono::Utc>,
}

/// Type alias for the response cache.
pub type ResponseCache = Cache<String, CachedEntry>;

/// Create the response cache.
pub fn new_cache() -> ResponseCache {
    Cache::builder()
        .max_capacity(CACHE_CAPACITY)
        .time_to_live(REPORT_TTL)
        .build()
}

/// Get a cached value or compute and cache it.
pub async fn get_or_compute<T, F, Fut>(
    cache: &ResponseCache,
    key: &str,
    compute: F,
) -> Result<T, ApiError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    if let Some(entry) = cache.get(key).await {
        match serde_json::from_str(&entry.json) {
            Ok(value) => {
                metrics::counter!("query_cache_hits_total").increment(1);
                tracing::debug!(key = %key, cached_at = %entry.cached_at, "cache hit");
                return Ok(value);
            }
            Err(e) => {
                // Corrupted entry, recompute
                tracing::warn!(key = %key, error = %e, "failed to deserialize cached entry");
            }
        }
    }

    tracing::debug!(key = %key, "cache miss, computing");
    let value = compute().await?;

    match serde_json::to_string(&value) {
        Ok(json) => {
            let entry = CachedEntry {
                json,
                cached_at: chrono::Utc::now(),
            };
            cache.insert(key.to_string(), entry).await;
        }
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "failed to serialize for cache");
        }
    }

    Ok(value)
}
