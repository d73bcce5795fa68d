//! Article identity: URL hashing and domain extraction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex characters kept by [`url_hash_short`], enough to identify an article
/// inside an idempotency key without bloating it.
const SHORT_HASH_LEN: usize = 8;

/// Fallback domain when the URL cannot be parsed.
const UNKNOWN_DOMAIN: &str = "unknown";

/// A unique piece of content tracked across the pipeline.
///
/// Upserted the first time any event references its URL; `first_seen_at` is
/// set once and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub url: String,
    pub url_hash: String,
    pub domain: String,
    pub source_name: String,
    pub first_seen_at: DateTime<Utc>,
}

impl Article {
    /// Build an article record from an incoming event, hashing the URL and
    /// extracting the domain at that time.
    pub fn from_event(url: &str, source_name: &str, first_seen_at: DateTime<Utc>) -> Self {
        Self {
            url: url.to_string(),
            url_hash: url_hash(url),
            domain: extract_domain(url),
            source_name: source_name.to_string(),
            first_seen_at,
        }
    }
}

/// Full SHA-256 hex digest of the raw URL.
pub fn url_hash(raw_url: &str) -> String {
    let digest = Sha256::digest(raw_url.as_bytes());
    hex::encode(digest)
}

/// First [`SHORT_HASH_LEN`] hex characters of the URL hash.
pub fn url_hash_short(raw_url: &str) -> String {
    let mut hash = url_hash(raw_url);
    hash.truncate(SHORT_HASH_LEN);
    hash
}

/// Hostname of the URL with any `www.` prefix removed, or `unknown` when the
/// URL cannot be parsed.
pub fn extract_domain(raw_url: &str) -> String {
    match url::Url::parse(raw_url) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) => host.strip_prefix("www.").unwrap_or(host).to_string(),
            None => UNKNOWN_DOMAIN.to_string(),
        },
        Err(_) => UNKNOWN_DOMAIN.to_string(),
    }
}
