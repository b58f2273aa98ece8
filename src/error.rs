//! Error types for the transport layer.
//!
//! Only the wire and connection plumbing surfaces `Result`s. Outcomes of
//! individual requests are never errors: they are terminal [`Response`]
//! values carrying a return code (see [`crate::rc`]).
//!
//! [`Response`]: crate::Response

use thiserror::Error;

/// Main error type for dial, framing and socket operations.
#[derive(Debug, Error)]
pub enum IprotoError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error (bad frame, unexpected ping, invalid return code width).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Dial failed or the ping handshake did not complete.
    #[error("dial error: {0}")]
    Dial(String),

    /// Connection closed while an operation was in progress.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Result type alias using [`IprotoError`].
pub type Result<T> = std::result::Result<T, IprotoError>;
