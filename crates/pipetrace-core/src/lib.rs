//! Core domain model for the pipetrace event tracker.
//!
//! This crate holds everything the ingest service, the API server, the
//! emission client, and the reconciliation job agree on:
//!
//! - [`stage`] - The closed set of pipeline stages and their ordering
//! - [`article`] - URL-keyed article identity (hashing, domain extraction)
//! - [`event`] - Pipeline events, ingest request shapes, idempotency keys,
//!   and timestamp validation
//! - [`window`] - Reporting periods (`today`, `24h`, `7d`, `30d`) resolved
//!   against a timezone offset
//! - [`metrics`] - Prometheus recorder bootstrap shared by all binaries
//!
//! No I/O happens here; storage and transport live in the sibling crates.

pub mod article;
pub mod error;
pub mod event;
pub mod metrics;
pub mod stage;
pub mod window;

pub use error::{Error, Result};

pub use article::{extract_domain, url_hash, url_hash_short, Article};
pub use event::{
    derive_idempotency_key, metadata_f64, metadata_str, BatchIngestRequest, EventDraft,
    IngestRequest, PipelineEvent, ValidationLimits, METADATA_SCHEMA_VERSION,
};
pub use stage::{Stage, LATENCY_SEGMENTS, STAGE_COUNT};
pub use window::{parse_timezone, Period, TimeWindow};
