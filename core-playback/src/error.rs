//! # Playback Error Types
//!
//! Error types for the streaming chunk cache.
//!
//! Most of these never reach the consumer: the orchestrator absorbs transient
//! fetch failures and reports cancellation as a plain `false`/`0`. They exist so
//! the internal components can say precisely what went wrong, and so logs can.

use bridge_traits::error::BridgeError;
use thiserror::Error;

/// Errors that can occur while filling or reading the chunk cache.
#[derive(Error, Debug)]
pub enum PlaybackError {
    // ========================================================================
    // Setup Errors
    // ========================================================================
    /// Configuration failed validation.
    #[error("Invalid cache configuration: {0}")]
    InvalidConfig(String),

    /// Resource descriptor could not be built (zero size, bad URL, ...).
    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    /// Construction happened outside a tokio runtime.
    #[error("No tokio runtime available: {0}")]
    RuntimeUnavailable(String),

    // ========================================================================
    // Fetch Errors
    // ========================================================================
    /// Chunk index is past the end of the resource.
    #[error("Chunk {index} out of range (resource has {total} chunks)")]
    ChunkOutOfRange { index: usize, total: usize },

    /// Server answered with a non-success status.
    #[error("HTTP status {status} while fetching {what}")]
    HttpStatus { status: u16, what: String },

    /// Server answered successfully but sent no bytes.
    #[error("Empty body for chunk {0}")]
    EmptyBody(usize),

    /// Chunk body does not have the length its index requires.
    #[error("Chunk {index} has {actual} bytes, expected {expected}")]
    LengthMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },

    /// Every retry attempt failed.
    #[error("Chunk {index} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        index: usize,
        attempts: u32,
        last_error: String,
    },

    /// Streaming download ended before the resource was complete.
    #[error("Stream ended after {received} of {expected} bytes")]
    PrematureEndOfStream { received: u64, expected: u64 },

    /// An operation exceeded its time bound.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The operation was cancelled cooperatively.
    #[error("Operation cancelled")]
    Cancelled,

    // ========================================================================
    // Generic Errors
    // ========================================================================
    /// Transport error from the host bridge.
    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Internal error (should not occur in normal operation).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PlaybackError {
    /// Returns `true` if this error is transient and the operation can be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            PlaybackError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            PlaybackError::Bridge(e) => e.is_retryable(),
            PlaybackError::EmptyBody(_)
            | PlaybackError::LengthMismatch { .. }
            | PlaybackError::PrematureEndOfStream { .. }
            | PlaybackError::Timeout(_)
            | PlaybackError::IoError(_) => true,
            _ => false,
        }
    }

    /// Returns `true` if this error is due to network issues.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            PlaybackError::HttpStatus { .. }
                | PlaybackError::Bridge(_)
                | PlaybackError::PrematureEndOfStream { .. }
                | PlaybackError::RetriesExhausted { .. }
        )
    }

    /// Returns `true` for cooperative cancellation, which callers treat as a stop, not a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PlaybackError::Cancelled)
    }
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, PlaybackError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let throttled = PlaybackError::HttpStatus {
            status: 429,
            what: "chunk 3".to_string(),
        };
        let missing = PlaybackError::HttpStatus {
            status: 404,
            what: "chunk 3".to_string(),
        };

        assert!(throttled.is_transient());
        assert!(!missing.is_transient());
        assert!(missing.is_network_error());
        assert!(PlaybackError::EmptyBody(0).is_transient());
        assert!(!PlaybackError::Cancelled.is_transient());
        assert!(PlaybackError::Cancelled.is_cancelled());
    }

    #[test]
    fn test_bridge_errors_convert() {
        let err: PlaybackError = BridgeError::Timeout("15s".to_string()).into();
        assert!(err.is_transient());
        assert!(err.is_network_error());
    }
}
