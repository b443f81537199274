//! Error types for wsmux.
//!
//! Connection-scoped failures (`FrameSignal`, `SendError`) never travel past
//! the connection that produced them. Only `ReactorError` ends `Reactor::run`.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Non-ASCII content where ASCII is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("non-ASCII byte 0x{byte:02x} at offset {position}")]
pub struct EncodingError {
    /// Offset of the first offending byte.
    pub position: usize,
    pub byte: u8,
}

/// Anything other than a decoded payload coming out of the WebSocket codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameSignal {
    /// Peer sent a close frame (opcode 0x8).
    #[error("connection closing")]
    Closing,

    /// Opcode other than text, or an unmasked client frame.
    #[error("unsupported frame (opcode 0x{opcode:x}, masked: {masked})")]
    Unsupported { opcode: u8, masked: bool },

    /// Unmasked payload is not ASCII.
    #[error("frame payload: {0}")]
    Encoding(#[from] EncodingError),

    /// Fewer bytes on hand than the header announces.
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// Payload length does not fit the 24-bit extended length field.
    #[error("payload of {0} bytes exceeds the 24-bit frame length limit")]
    TooLarge(usize),
}

/// Failure on the send surface of a connection.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("framing failed: {0}")]
    Frame(#[from] FrameSignal),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed")]
    Closed,
}

/// Failure while opening the listening socket or the selector.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to create poll instance: {0}")]
    Poll(#[source] io::Error),

    #[error("failed to register listener: {0}")]
    Register(#[source] io::Error),
}

/// Unexpected fault inside the event loop. Terminates the server.
#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("readiness wait failed: {0}")]
    Poll(#[source] io::Error),

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}

/// Bad value in the environment-driven configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum TickerError {
    #[error("tick interval must be non-zero")]
    ZeroInterval,

    #[error("failed to spawn ticker thread: {0}")]
    Spawn(#[from] io::Error),
}
