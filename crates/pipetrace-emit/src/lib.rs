//! Emission client embedded in every pipeline producer.
//!
//! The client wraps HTTP calls to the pipetrace ingest API so that telemetry
//! can never become the bottleneck or failure point of the pipeline it
//! instruments:
//!
//! - Calls carry a short bounded timeout (2s by default)
//! - A circuit breaker turns calls into instant no-ops while the ingest
//!   service is failing
//! - With no endpoint configured the client is inert from construction
//! - `occurred_at` is stamped by the client in UTC, not by the caller
//!
//! Failed emissions are dropped and logged, never retried; correctness
//! depends on the reconciliation job, not on first-attempt delivery.
//!
//! # Lifecycle
//!
//! Construct one [`EmitClient`] at process startup and share it (it is cheap
//! to clone). No teardown is required; it is safe to leak on process exit.

pub mod breaker;
pub mod client;
pub mod error;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use client::{BatchOutcome, BatchReceipt, EmitClient, EmitConfig, EmitOutcome};
pub use error::{EmitError, EmitResult};
