//! Error types for seqwire.

use thiserror::Error;

/// Main error type for all seqwire operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Header shorter than 10 bytes or carrying a command_length below 10.
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// A length field exceeds its permitted maximum.
    #[error("length overflow: {0}")]
    LengthOverflow(String),

    /// A PDU body ended before a required field was complete.
    #[error("truncated PDU: {0}")]
    Truncated(String),

    /// Command id not defined by the protocol.
    #[error("unknown PDU: command id {0:#04x}")]
    UnknownPdu(u8),

    /// Receive buffer cannot hold the requested region.
    #[error("receive buffer overflow")]
    BufferOverflow,

    /// Session configuration rejected at construction.
    #[error("invalid session configuration: {0}")]
    ConfigInvalid(String),

    /// Operation not permitted in the session's current state.
    #[error("operation forbidden in state {0}")]
    StateForbidden(&'static str),

    /// Send attempted on a closed session.
    #[error("session closed")]
    SessionClosed,
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
