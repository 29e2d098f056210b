use std::io;
use thiserror::Error;

/// Errors surfaced by the transport at operation boundaries.
#[derive(Error, Debug)]
pub enum TransportError {
    /// An I/O error occurred on the underlying UDP socket.
    #[error("Network I/O error: {0}")]
    Io(#[from] io::Error),

    /// A packet could not be parsed from the wire.
    #[error("Packet decode error: {0}")]
    Codec(#[from] CodecError),

    /// The handshake did not complete (version mismatch, cookie rejection,
    /// or retries exhausted without a response).
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The peer went silent past the expiration limit, or sent a malformed
    /// acknowledgment that invalidated the flow.
    #[error("Connection is broken")]
    ConnectionBroken,

    /// The peer shut down while local data was still outstanding.
    #[error("Connection reset by peer with data outstanding")]
    ConnectionReset,

    /// Operation on a flow that has already been closed locally.
    #[error("Flow is closed")]
    Closed,

    /// A non-blocking send found the send buffer full.
    #[error("Send buffer is full")]
    WouldBlock,

    /// The supplied configuration value is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors produced while encoding or decoding wire data.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Datagram too short: needed {needed} bytes, had {remaining}")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("Unknown control packet type: {0:#06x}")]
    UnknownControlType(u16),

    #[error("Invalid field: {0}")]
    InvalidField(String),
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
