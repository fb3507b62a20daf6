//! # Transport Boundary
//!
//! Interfaces between a session and the layers around it.
//!
//! ## Components
//! - **Connection**: one peer's transport object (TCP, UDP, ...)
//! - **ConnectionEvents**: callbacks the transport raises on its own I/O threads
//! - **SessionRegistry**: the owner of all live sessions, told about disconnections
//!
//! Reliability, ordering and reconnection are the transport's business; a
//! session only forwards the requested [`DeliveryMode`].

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use crate::core::envelope::DeliveryMode;
use crate::error::{ProtocolError, Result};
use crate::service::session::Session;
use crate::utils::buffer_pool::PooledBuffer;

/// Identifier assigned to a session by its registry
pub type SessionId = u16;

/// Transport-level connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Callbacks raised by a [`Connection`]. May be invoked from any thread.
pub trait ConnectionEvents: Send + Sync {
    fn on_buffer_received(&self, buffer: PooledBuffer, channel: u8, delivery_mode: DeliveryMode);

    /// The transport closed. `error` is `None` for a clean remote close.
    fn on_disconnected(&self, error: Option<ProtocolError>);
}

/// One peer's transport object.
///
/// Dropping the connection releases the underlying transport resources.
pub trait Connection: Send + Sync {
    /// Begin delivering inbound buffers to `events`.
    fn start_listening(&self, events: Weak<dyn ConnectionEvents>) -> Result<()>;

    /// Tear the connection down. Returns false if it was already closed.
    fn disconnect(&self) -> bool;

    /// Transmit a buffer synchronously. Returns false on failure.
    fn send(&self, buffer: &[u8], channel: u8, delivery_mode: DeliveryMode) -> bool;

    /// Remote endpoint for the named protocol (e.g. "tcp", "udp").
    fn remote_endpoint(&self, protocol: &str) -> Option<SocketAddr>;

    fn state(&self) -> ConnectionState;
}

/// The set of live sessions.
pub trait SessionRegistry: Send + Sync {
    /// A session's connection closed; `requested_locally` is true when the
    /// server initiated it.
    fn handle_disconnection(
        &self,
        session: &Arc<Session>,
        requested_locally: bool,
        error: Option<&ProtocolError>,
    );
}
