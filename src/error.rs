//! Error types for stdiowire.

use thiserror::Error;

use crate::protocol::FrameError;

/// Main error type for all transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error on the underlying descriptors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame-level error (bad or missing Content-Length).
    #[error("framing error: {0}")]
    Framing(#[from] FrameError),
}

/// Result type alias using TransportError.
pub type Result<T> = std::result::Result<T, TransportError>;
