//! Error types for the storage and reconciliation layer.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the event store, the idempotency index, and the
/// reconciliation engine.
#[derive(Error, Debug)]
pub enum Error {
    /// RocksDB error from the idempotency index.
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// ClickHouse error from the event store.
    #[error("ClickHouse error: {0}")]
    ClickHouse(#[from] clickhouse::error::Error),

    /// SQLite error from a producer audit database.
    #[error("audit database error: {0}")]
    Audit(#[from] rusqlite::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Domain validation error.
    #[error(transparent)]
    Core(#[from] pipetrace_core::Error),

    /// Reconciliation config could not be parsed.
    #[error("reconcile config error: {0}")]
    ReconcileConfig(#[from] toml::de::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}
