//! # Error Types
//!
//! Error handling for the session layer.
//!
//! This module defines every error variant a session can observe, from transport
//! failures at listen time to malformed frames and misbehaving subscribers.
//!
//! ## Error Categories
//! - **Transport Errors**: socket failures, closed connections
//! - **Framing Errors**: undersized buffers, bad headers, oversized payloads
//! - **Subscriber Errors**: handlers that returned an error or panicked
//! - **Configuration Errors**: invalid or unreadable configuration
//!
//! Framing errors never escape a session: they are converted into moderation
//! strikes. Subscriber errors are caught at the dispatch boundary.
//!
//! ## Example Usage
//! ```rust
//! use peer_session::core::envelope::Envelope;
//! use peer_session::error::ProtocolError;
//! use peer_session::utils::buffer_pool::BufferPool;
//!
//! let pool = BufferPool::new(4);
//! let buffer = pool.acquire_from(&[0x00, 0x07]);
//! match Envelope::from_buffer(buffer, true) {
//!     Err(ProtocolError::BufferTooSmall { needed, actual }) => assert!(actual < needed),
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Event handler errors
    pub const ERR_HANDLERS_WRITE_LOCK: &str = "Failed to acquire write lock on event handlers";

    /// Subscriber errors
    pub const ERR_SUBSCRIBER_FAILED: &str = "One or more subscribers failed";
    pub const ERR_UNKNOWN_PANIC: &str = "handler panicked with a non-string payload";
}

// ProtocolError is the primary error type for all session operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Buffer too small: need at least {needed} bytes, got {actual}")]
    BufferTooSmall { needed: usize, actual: usize },

    #[error("Unknown delivery mode: {0}")]
    UnknownDeliveryMode(u8),

    #[error("Payload length mismatch: header declares {declared} bytes, buffer holds {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    #[error("Handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Build a `HandlerPanicked` error from a `catch_unwind` payload.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            constants::ERR_UNKNOWN_PANIC.to_string()
        };
        ProtocolError::HandlerPanicked(message)
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
