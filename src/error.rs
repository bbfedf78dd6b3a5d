//! Error types for tcpcore
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using NetError
pub type Result<T> = std::result::Result<T, NetError>;

/// Unified error type for tcpcore operations
#[derive(Debug, Error)]
pub enum NetError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not resolve address: {0}")]
    AddrResolve(String),

    // -------------------------------------------------------------------------
    // Protocol Errors
    // -------------------------------------------------------------------------
    #[error("Protocol error: {0}")]
    Protocol(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Connection Errors
    // -------------------------------------------------------------------------
    #[error("use of closed connection")]
    ConnectionClosed,

    #[error("send buffer is full")]
    BufferFull,

    #[error("connection closed by peer")]
    Eof,

    #[error("handler panicked: {0}")]
    HandlerPanic(String),

    // -------------------------------------------------------------------------
    // Server Errors
    // -------------------------------------------------------------------------
    #[error("server closed")]
    ServerClosed,
}

impl NetError {
    /// True when the peer finished the stream cleanly, between packets.
    ///
    /// A stream that ends part way through a packet is a protocol error, not
    /// an EOF.
    pub fn is_eof(&self) -> bool {
        matches!(self, NetError::Eof)
    }
}
