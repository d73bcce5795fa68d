//! Pipetrace HTTP API.
//!
//! Serves the ingest endpoints producers post to and the aggregate reports
//! dashboards read. All state lives in ClickHouse and the RocksDB
//! idempotency index; the server itself is stateless apart from its
//! response cache and can be restarted freely.

pub mod cache;
pub mod error;
pub mod rate_limit;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use rate_limit::{IngestRateLimiter, RateLimitResult};
pub use routes::router;
pub use state::{AppState, Config};
