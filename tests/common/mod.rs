//! Mock transport and registry shared by the integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::BufMut;
use peer_session::config::NetworkConfig;
use peer_session::core::envelope::{DeliveryMode, Envelope, Tag};
use peer_session::error::{ProtocolError, Result};
use peer_session::protocol::dispatcher::Dispatcher;
use peer_session::service::session::{Session, SessionContext};
use peer_session::transport::{
    Connection, ConnectionEvents, ConnectionState, SessionId, SessionRegistry,
};
use peer_session::utils::metrics::MetricsRegistry;

pub struct SentBuffer {
    pub bytes: Vec<u8>,
    pub channel: u8,
    pub delivery_mode: DeliveryMode,
}

#[derive(Default)]
pub struct MockConnection {
    pub sent: Mutex<Vec<SentBuffer>>,
    pub disconnects: AtomicUsize,
    closed: AtomicBool,
    pub fail_listen: AtomicBool,
    pub fail_send: AtomicBool,
    /// Raise `on_disconnected` from inside `disconnect()`, as many transports do.
    pub close_inline: AtomicBool,
    events: Mutex<Option<Weak<dyn ConnectionEvents>>>,
}

impl MockConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Raise the transport's "disconnected" callback.
    pub fn drop_remote(&self, error: Option<ProtocolError>) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify_disconnected(error);
    }

    fn notify_disconnected(&self, error: Option<ProtocolError>) {
        let events = self.events.lock().unwrap().as_ref().and_then(Weak::upgrade);
        if let Some(events) = events {
            events.on_disconnected(error);
        }
    }

    pub fn is_listening(&self) -> bool {
        self.events.lock().unwrap().is_some()
    }
}

impl Connection for MockConnection {
    fn start_listening(&self, events: Weak<dyn ConnectionEvents>) -> Result<()> {
        if self.fail_listen.load(Ordering::SeqCst) {
            return Err(ProtocolError::Io(io::Error::new(
                io::ErrorKind::AddrInUse,
                "socket unavailable",
            )));
        }
        *self.events.lock().unwrap() = Some(events);
        Ok(())
    }

    fn disconnect(&self) -> bool {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if self.close_inline.load(Ordering::SeqCst) {
            self.notify_disconnected(None);
        }
        true
    }

    fn send(&self, buffer: &[u8], channel: u8, delivery_mode: DeliveryMode) -> bool {
        if self.closed.load(Ordering::SeqCst) || self.fail_send.load(Ordering::SeqCst) {
            return false;
        }
        self.sent.lock().unwrap().push(SentBuffer {
            bytes: buffer.to_vec(),
            channel,
            delivery_mode,
        });
        true
    }

    fn remote_endpoint(&self, protocol: &str) -> Option<SocketAddr> {
        match protocol {
            "tcp" => "127.0.0.1:4296".parse().ok(),
            _ => None,
        }
    }

    fn state(&self) -> ConnectionState {
        if self.closed.load(Ordering::SeqCst) {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Connected
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnection {
    pub session: SessionId,
    pub requested_locally: bool,
    pub error: Option<String>,
}

#[derive(Default)]
pub struct MockRegistry {
    pub disconnections: Mutex<Vec<Disconnection>>,
}

impl MockRegistry {
    pub fn disconnections(&self) -> Vec<Disconnection> {
        self.disconnections.lock().unwrap().clone()
    }
}

impl SessionRegistry for MockRegistry {
    fn handle_disconnection(
        &self,
        session: &Arc<Session>,
        requested_locally: bool,
        error: Option<&ProtocolError>,
    ) {
        self.disconnections.lock().unwrap().push(Disconnection {
            session: session.id(),
            requested_locally,
            error: error.map(ToString::to_string),
        });
    }
}

pub struct Harness {
    pub session: Arc<Session>,
    pub connection: Arc<MockConnection>,
    pub registry: Arc<MockRegistry>,
    pub metrics: Arc<MetricsRegistry>,
}

pub fn harness(id: SessionId, dispatcher: Arc<dyn Dispatcher>) -> Harness {
    harness_with_config(id, dispatcher, &NetworkConfig::default())
}

pub fn harness_with_config(
    id: SessionId,
    dispatcher: Arc<dyn Dispatcher>,
    config: &NetworkConfig,
) -> Harness {
    let connection = MockConnection::new();
    let registry = Arc::new(MockRegistry::default());
    let metrics = Arc::new(MetricsRegistry::new());

    let weak_registry = Arc::downgrade(&registry);
    let weak_registry: Weak<dyn SessionRegistry> = weak_registry;
    let ctx = SessionContext::new(weak_registry, dispatcher, metrics.clone(), config);
    let session = Session::new(id, connection.clone(), ctx);

    Harness {
        session,
        connection,
        registry,
        metrics,
    }
}

impl Harness {
    /// Feed raw bytes to the session as if the transport received them.
    pub fn receive(&self, bytes: &[u8], channel: u8, delivery_mode: DeliveryMode) {
        let buffer = self.session.pool().acquire_from(bytes);
        self.session
            .handle_incoming_buffer(buffer, channel, delivery_mode);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.metrics.counter_value(name).unwrap_or(0)
    }
}

/// Encode a well-formed frame.
pub fn frame(tag: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.put_u16(tag);
    out.put_u8(0);
    out.put_u8(DeliveryMode::Reliable.as_byte());
    out.put_u32(payload.len() as u32);
    out.extend_from_slice(payload);
    out
}

/// Decode a buffer captured by [`MockConnection`].
pub fn decode_sent(sent: &SentBuffer) -> (Tag, Vec<u8>) {
    let pool = peer_session::utils::buffer_pool::BufferPool::new(0);
    let envelope = Envelope::from_buffer(pool.acquire_from(&sent.bytes), true).expect("valid frame");
    (envelope.tag(), envelope.payload().to_vec())
}
