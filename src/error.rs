//! # Error Types
//!
//! Error handling for the session protocol layer.
//!
//! Every fallible operation in the crate returns [`Result`], which carries a
//! [`ProtocolError`]. Errors are scoped: a decode or transport failure ends the
//! affected session only, handler panics are contained per invocation, and the
//! hub and client never let one session's failure leak into another.
//!
//! ## Error Categories
//! - **Framing**: malformed headers and oversized frames
//! - **Transport**: socket, WebSocket and TLS failures
//! - **Dispatch**: unregistered message types, handler panics
//! - **Client**: slot exhaustion, request timeouts, duplicate correlation keys
//!
//! ## Example Usage
//! ```rust
//! use frame_session::core::frame::Frame;
//! use frame_session::error::ProtocolError;
//!
//! match Frame::from_bytes(&[0x01, 0x00]) {
//!     Err(ProtocolError::MalformedFrame(reason)) => println!("rejected: {reason}"),
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to avoid allocating on common error paths.
pub mod constants {
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_SHORT_HEADER: &str = "fewer than 8 header bytes";
    pub const ERR_LENGTH_BELOW_HEADER: &str = "declared length smaller than header";
    pub const ERR_TEXT_MESSAGE: &str = "text message on a binary channel";
    pub const ERR_UNKNOWN_PANIC: &str = "unknown panic payload";
}

/// Primary error type for all protocol operations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Handler panicked: {0}")]
    HandlerPanic(String),

    #[error("No handler registered for message type {0}")]
    Unregistered(u32),

    #[error("Client capacity exceeded ({0} slots)")]
    CapacityExceeded(u32),

    #[error("Invalid client slot: {0}")]
    InvalidSlot(u32),

    #[error("Reconnect already in progress for slot {0}")]
    ReconnectInProgress(u32),

    #[error("Request key {0} is already outstanding")]
    DuplicateRequest(u64),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for ProtocolError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Io(e) => ProtocolError::Io(e),
            WsError::ConnectionClosed | WsError::AlreadyClosed => ProtocolError::ConnectionClosed,
            other => ProtocolError::WebSocket(other.to_string()),
        }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
