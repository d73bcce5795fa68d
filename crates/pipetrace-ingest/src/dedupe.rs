//! Idempotency index using RocksDB.
//!
//! This module provides the [`IdempotencyIndex`] which answers "has this
//! `(idempotency_key, occurred_at)` pair been accepted before" synchronously
//! at ingest time. ClickHouse has no unique constraints, and its
//! ReplacingMergeTree only collapses duplicates at merge time, so the index
//! is what lets the API report a duplicate in the same request.
//!
//! Check and mark are separate steps: the store checks while planning a
//! batch and marks only after ClickHouse accepted the rows, so a failed
//! insert never strands an identity as a phantom duplicate.
//!
//! # Key Design
//!
//! - Keys: 32-byte SHA-256 over the identity being tracked (raw bytes)
//! - Values: 1 byte kind tag
//! - Bloom filters for fast "not seen" lookups
//! - Rebuildable from the event store if lost/corrupted

use crate::error::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use rocksdb::{DBWithThreadMode, MultiThreaded, Options};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Kind tag stored as the value of each index entry.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    /// An accepted event, keyed by `(idempotency_key, occurred_at)`.
    Event = 1,
    /// A known article, keyed by its URL hash.
    Article = 2,
}

/// Index key for an event identity.
fn event_key(idempotency_key: &str, occurred_at: DateTime<Utc>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(idempotency_key.as_bytes());
    hasher.update([0]);
    hasher.update(
        occurred_at
            .to_rfc3339_opts(SecondsFormat::Secs, true)
            .as_bytes(),
    );
    hasher.finalize().into()
}

/// Index key for an article identity. A distinct prefix keeps article keys
/// out of the event keyspace even for pathological inputs.
fn article_key(url_hash: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"article");
    hasher.update([0]);
    hasher.update(url_hash.as_bytes());
    hasher.finalize().into()
}

/// RocksDB-backed idempotency index.
///
/// Thread-safe: can be shared across tasks via `Arc<IdempotencyIndex>`.
pub struct IdempotencyIndex {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl IdempotencyIndex {
    /// Open or create the index at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening idempotency index at {}", path.display());

        let mut opts = Options::default();
        opts.create_if_missing(true);

        // Write-heavy workload, point lookups only
        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_max_write_buffer_number(3);
        opts.set_target_file_size_base(64 * 1024 * 1024);

        // Bloom filters for fast "not found" lookups
        // 10 bits per key = ~1% false positive rate
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        block_opts.set_cache_index_and_filter_blocks(true);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        opts.increase_parallelism(num_cpus::get() as i32);
        opts.set_max_background_jobs(4);

        let db = DBWithThreadMode::<MultiThreaded>::open(&opts, path)?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Whether an event identity has been accepted before.
    pub fn has_event(&self, idempotency_key: &str, occurred_at: DateTime<Utc>) -> Result<bool> {
        Ok(self.db.get(event_key(idempotency_key, occurred_at))?.is_some())
    }

    /// Mark an event identity as accepted.
    ///
    /// The store marks only after ClickHouse accepted the rows; a failed
    /// insert leaves the identity unmarked and the event retriable.
    pub fn mark_event(&self, idempotency_key: &str, occurred_at: DateTime<Utc>) -> Result<()> {
        self.db.put(
            event_key(idempotency_key, occurred_at),
            [EntryKind::Event as u8],
        )?;
        Ok(())
    }

    /// Whether an article URL hash has been seen before.
    pub fn has_article(&self, url_hash: &str) -> Result<bool> {
        Ok(self.db.get(article_key(url_hash))?.is_some())
    }

    /// Mark an article URL hash as seen. Crash between insert and mark is
    /// tolerated by the store's ReplacingMergeTree collapse.
    pub fn mark_article(&self, url_hash: &str) -> Result<()> {
        self.db
            .put(article_key(url_hash), [EntryKind::Article as u8])?;
        Ok(())
    }

    /// Get the approximate number of keys in the index.
    pub fn approximate_count(&self) -> Result<u64> {
        let count = self
            .db
            .property_int_value("rocksdb.estimate-num-keys")?
            .unwrap_or(0);
        Ok(count)
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
