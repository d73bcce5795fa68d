//! Error types for the emission client.

use thiserror::Error;

/// Result type alias using the emission error type.
pub type EmitResult<T> = std::result::Result<T, EmitError>;

/// Errors from a single emission attempt.
///
/// These are returned so callers that specifically care can inspect them, but
/// the intended handling is a logged warning, never a propagated failure.
#[derive(Error, Debug)]
pub enum EmitError {
    /// The HTTP request failed (connection, timeout, DNS).
    #[error("emit request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The ingest service answered with an error status.
    #[error("ingest service error: status {0}")]
    Status(u16),

    /// The event payload or the server's reply could not be (de)serialized.
    #[error("payload codec: {0}")]
    Codec(#[from] serde_json::Error),
}
