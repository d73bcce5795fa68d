//! Pipetrace storage and reconciliation components.
//!
//! This crate owns everything between a validated ingest request and the
//! aggregate queries: the idempotency index, the ClickHouse event store,
//! partition retention, and the audit-trail reconciliation engine.
//!
//! # Modules
//!
//! - [`dedupe`] - RocksDB index answering duplicate checks synchronously
//! - [`schema`] - idempotent ClickHouse DDL bootstrap
//! - [`store`] - event/article writes and aggregate reads
//! - [`partition`] - partition inventory and retention sweeps
//! - [`audit`] - read-only access to producer audit SQLite databases
//! - [`reconcile`] - gap detection, classification, and backfill replay
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  Ingest request  │  (validated by pipetrace-serve)
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │ IdempotencyIndex │  RocksDB - (idempotency_key, occurred_at) seen?
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │    EventStore    │  ClickHouse - append-only facts, monthly partitions
//! └──────────────────┘
//! ```
//!
//! The event store is append-only: events are never updated, and the only
//! delete is a whole-partition drop by the retention sweep.

pub mod audit;
pub mod dedupe;
pub mod error;
pub mod partition;
pub mod reconcile;
pub mod schema;
pub mod store;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use audit::{AuditReader, AuditRow};
pub use dedupe::IdempotencyIndex;
pub use partition::{PartitionInfo, PartitionManager};
pub use reconcile::{
    GapKind, GapReport, OutageWindow, ProducerConfig, ProducerOutcome, ReconcileConfig, Reconciler,
};
pub use store::{
    EventStore, FunnelRow, InsertOutcome, LatencySummary, ModelVersionRow, TopicCountRow,
    VolumeRow,
};
