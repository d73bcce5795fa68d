//! Error types shared across the pipetrace crates.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by domain-level validation and parsing.
#[derive(Error, Debug)]
pub enum Error {
    /// The stage name is not one of the recognised pipeline stages.
    #[error("unknown pipeline stage: {0}")]
    UnknownStage(String),

    /// `occurred_at` failed the recency/skew window checks.
    #[error("invalid occurred_at: {0}")]
    Timestamp(String),

    /// A required field is missing or empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// The reporting period string is not recognised.
    #[error("invalid period: {0} (valid: today, 24h, 7d, 30d)")]
    InvalidPeriod(String),

    /// The timezone parameter could not be parsed.
    #[error("invalid timezone: {0} (use UTC or a fixed offset like +05:00)")]
    InvalidTimezone(String),

    /// Metadata payload is not a JSON object.
    #[error("metadata must be a JSON object")]
    InvalidMetadata,
}
