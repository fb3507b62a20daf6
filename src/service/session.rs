//! # Session
//!
//! Application-level state for one connected peer.
//!
//! A session owns its [`Connection`], decodes inbound buffers into envelopes,
//! polices them through the [`ModerationPolicy`] and relays accepted envelopes
//! to `message_received` handlers on the owning context.
//!
//! ## Threading
//! Transport callbacks arrive on I/O threads. Counters are atomic; everything a
//! handler observes is marshaled through the [`Dispatcher`]. Each dispatched
//! event holds its own envelope duplicate and a strong reference to the session,
//! so the transport thread can release its copy immediately.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::SystemTime;

use tracing::{debug, error, instrument, trace, warn};

use crate::config::{ModerationConfig, NetworkConfig, SessionConfig};
use crate::core::envelope::{DeliveryMode, Envelope, Tag};
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::events::{EventHandlers, MessageReceivedEvent, StrikeEvent};
use crate::protocol::moderation::{ModerationPolicy, Strike, StrikeReason, StrikeTarget};
use crate::transport::{
    Connection, ConnectionEvents, ConnectionState, SessionId, SessionRegistry,
};
use crate::utils::buffer_pool::{BufferPool, PooledBuffer};
use crate::utils::metrics::{Counter, Histogram, MetricsSink, Timer};

/// Collaborators shared by every session of a server.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Weak<dyn SessionRegistry>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub metrics: Arc<dyn MetricsSink>,
    pub pool: BufferPool,
    pub session: SessionConfig,
    pub moderation: ModerationConfig,
}

impl SessionContext {
    pub fn new(
        registry: Weak<dyn SessionRegistry>,
        dispatcher: Arc<dyn Dispatcher>,
        metrics: Arc<dyn MetricsSink>,
        config: &NetworkConfig,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            metrics,
            pool: BufferPool::with_settings(config.buffers.pool_size, config.buffers.buffer_capacity),
            session: config.session.clone(),
            moderation: config.moderation.clone(),
        }
    }
}

/// Point-in-time counters for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub id: SessionId,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_pushed: u64,
    pub connected_at: SystemTime,
}

struct SessionMetrics {
    messages_sent: Counter,
    messages_received: Counter,
    messages_pushed: Counter,
    event_failures: Counter,
    event_time: Histogram,
}

impl SessionMetrics {
    fn new(sink: &dyn MetricsSink) -> Self {
        Self {
            messages_sent: sink.counter("messages_sent", "Envelopes sent to peers"),
            messages_received: sink.counter("messages_received", "Buffers received from peers"),
            messages_pushed: sink.counter("messages_pushed", "Buffers handed to the transport"),
            event_failures: sink.counter(
                "message_received_event_failures",
                "Message handlers that returned an error or panicked",
            ),
            event_time: sink.histogram(
                "message_received_event_time",
                "Time spent in message handlers",
            ),
        }
    }
}

pub struct Session {
    id: SessionId,
    connection: RwLock<Option<Arc<dyn Connection>>>,
    registry: Weak<dyn SessionRegistry>,
    dispatcher: Arc<dyn Dispatcher>,
    pool: BufferPool,
    config: SessionConfig,
    moderation: ModerationPolicy,
    message_received: EventHandlers<MessageReceivedEvent>,
    metrics: SessionMetrics,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_pushed: AtomicU64,
    connected_at: SystemTime,
    closed: AtomicBool,
    disposed: AtomicBool,
    self_ref: Weak<Session>,
}

impl Session {
    pub fn new(id: SessionId, connection: Arc<dyn Connection>, ctx: SessionContext) -> Arc<Self> {
        let metrics = SessionMetrics::new(ctx.metrics.as_ref());
        let moderation =
            ModerationPolicy::new(ctx.moderation, Arc::clone(&ctx.dispatcher), ctx.metrics.as_ref());

        Arc::new_cyclic(|self_ref| Self {
            id,
            connection: RwLock::new(Some(connection)),
            registry: ctx.registry,
            dispatcher: ctx.dispatcher,
            pool: ctx.pool,
            config: ctx.session,
            moderation,
            message_received: EventHandlers::new("message_received"),
            metrics,
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_pushed: AtomicU64::new(0),
            connected_at: SystemTime::now(),
            closed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Acquire)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Acquire)
    }

    pub fn messages_pushed(&self) -> u64 {
        self.messages_pushed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            id: self.id,
            messages_sent: self.messages_sent(),
            messages_received: self.messages_received(),
            messages_pushed: self.messages_pushed(),
            connected_at: self.connected_at,
        }
    }

    /// Handlers for accepted application envelopes
    pub fn message_received(&self) -> &EventHandlers<MessageReceivedEvent> {
        &self.message_received
    }

    /// Handlers for strikes; any of them may forgive
    pub fn strike_occurred(&self) -> &EventHandlers<StrikeEvent> {
        self.moderation.handlers()
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection()
            .map(|c| c.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn remote_endpoint(&self, protocol: &str) -> Option<SocketAddr> {
        self.connection()?.remote_endpoint(protocol)
    }

    /// Start receiving and send the peer its identity.
    ///
    /// Failures are reported to the registry; the session does not retry.
    #[instrument(skip(self), fields(session_id = self.id))]
    pub fn start_listening(&self) -> Result<()> {
        let connection = self.connection().ok_or(ProtocolError::ConnectionClosed)?;

        let events: Weak<dyn ConnectionEvents> = self.self_ref.clone();
        if let Err(e) = connection.start_listening(events) {
            error!(error = %e, "Failed to start listening");
            if !self.closed.swap(true, Ordering::AcqRel) {
                self.report_disconnection(false, Some(&e));
            }
            return Err(e);
        }

        let identity = Envelope::create(Tag::CONFIGURE, self.pool.acquire_from(&self.id.to_be_bytes()));
        if !self.push(connection.as_ref(), &identity, 0, DeliveryMode::ReliableOrdered) {
            let e = ProtocolError::ConnectionClosed;
            warn!(error = %e, "Failed to send identity envelope");
            if !self.closed.swap(true, Ordering::AcqRel) {
                self.report_disconnection(false, Some(&e));
            }
            return Err(e);
        }

        debug!("Session listening");
        Ok(())
    }

    /// Send an envelope to the peer. Returns false if the transport refused it.
    pub fn send_message(&self, message: &Envelope, channel: u8, delivery_mode: DeliveryMode) -> bool {
        let Some(connection) = self.connection() else {
            return false;
        };
        if !self.push(connection.as_ref(), message, channel, delivery_mode) {
            trace!(session_id = self.id, tag = %message.tag(), "Send failed");
            return false;
        }

        self.messages_sent.fetch_add(1, Ordering::AcqRel);
        self.metrics.messages_sent.increment();
        true
    }

    /// Close the connection from this side. Returns false if it was already closed.
    #[instrument(skip(self), fields(session_id = self.id))]
    pub fn disconnect(&self) -> bool {
        // Claimed before the transport call: callbacks raised inline while
        // closing must see the session as already closed.
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let closed = self.connection().is_some_and(|c| c.disconnect());
        if !closed {
            self.closed.store(false, Ordering::Release);
            return false;
        }

        debug!("Session disconnected locally");
        self.report_disconnection(true, None);
        true
    }

    /// Issue a strike. Weight defaults are applied by the `strike_*` helpers.
    pub fn strike(&self, reason: StrikeReason, detail: Option<String>, weight: u32) {
        let strike = Strike::new(reason, detail, weight);
        match self.self_ref.upgrade() {
            Some(me) => ModerationPolicy::strike(&me, strike),
            None => warn!(session_id = self.id, reason = %strike.reason, "Strike on a dropped session ignored"),
        }
    }

    /// Plugin-requested strike with the default weight
    pub fn strike_plugin(&self, detail: Option<&str>) {
        let weight = self.moderation.config().default_strike_weight;
        self.strike(StrikeReason::PluginRequested, detail.map(str::to_owned), weight);
    }

    /// Plugin-requested strike with an explicit weight
    pub fn strike_with_weight(&self, detail: &str, weight: u32) {
        self.strike(StrikeReason::PluginRequested, Some(detail.to_owned()), weight);
    }

    /// Decode and route one inbound buffer.
    pub fn handle_incoming_buffer(&self, buffer: PooledBuffer, channel: u8, delivery_mode: DeliveryMode) {
        self.messages_received.fetch_add(1, Ordering::AcqRel);
        self.metrics.messages_received.increment();

        let envelope = match Envelope::from_buffer(buffer, self.config.validate_headers) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(session_id = self.id, error = %e, "Dropping malformed frame");
                self.protocol_strike(StrikeReason::InvalidFrame, e.to_string());
                return;
            }
        };

        if envelope.len() > self.config.max_payload_size {
            let err = ProtocolError::OversizedPacket(envelope.len());
            envelope.dispose();
            self.protocol_strike(StrikeReason::InvalidFrame, err.to_string());
            return;
        }

        self.handle_message(&envelope, channel, delivery_mode);
    }

    fn handle_message(&self, envelope: &Envelope, channel: u8, delivery_mode: DeliveryMode) {
        if envelope.tag().is_command() {
            self.protocol_strike(
                StrikeReason::DisallowedCommand,
                format!("peer sent reserved tag {}", envelope.tag()),
            );
            return;
        }

        let Some(session) = self.self_ref.upgrade() else {
            return;
        };
        let duplicate = envelope.duplicate();
        let failures = self.metrics.event_failures.clone();
        let event_time = self.metrics.event_time.clone();

        self.dispatcher.dispatch_if_needed(Box::new(move || -> Result<()> {
            let event = MessageReceivedEvent {
                envelope: duplicate,
                channel,
                delivery_mode,
                session,
            };
            let timer = Timer::start("message_received", event_time);
            let errors = event.session.message_received.invoke(&event);
            if errors.is_empty() {
                timer.stop();
            } else {
                for _ in &errors {
                    failures.increment();
                }
            }
            Ok(())
        }));
    }

    fn protocol_strike(&self, reason: StrikeReason, detail: String) {
        let weight = self.moderation.config().protocol_violation_weight;
        self.strike(reason, Some(detail), weight);
    }

    /// Release the connection. Further calls do nothing.
    pub fn dispose(&self) {
        if self
            .disposed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let connection = match self.connection.write() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(connection);
        debug!(session_id = self.id, "Session disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn connection(&self) -> Option<Arc<dyn Connection>> {
        match self.connection.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn push(
        &self,
        connection: &dyn Connection,
        envelope: &Envelope,
        channel: u8,
        delivery_mode: DeliveryMode,
    ) -> bool {
        let mut buffer = self.pool.acquire();
        if let Err(e) = envelope.encode_into(channel, delivery_mode, &mut *buffer) {
            error!(session_id = self.id, error = %e, "Failed to encode envelope");
            return false;
        }

        self.messages_pushed.fetch_add(1, Ordering::AcqRel);
        self.metrics.messages_pushed.increment();
        connection.send(&buffer, channel, delivery_mode)
    }

    fn report_disconnection(&self, requested_locally: bool, error: Option<&ProtocolError>) {
        match (self.registry.upgrade(), self.self_ref.upgrade()) {
            (Some(registry), Some(me)) => registry.handle_disconnection(&me, requested_locally, error),
            _ => debug!(session_id = self.id, "No registry to report disconnection to"),
        }
    }
}

impl StrikeTarget for Session {
    fn target_id(&self) -> u16 {
        self.id
    }

    fn moderation(&self) -> &ModerationPolicy {
        &self.moderation
    }

    fn disconnect(&self) -> bool {
        Session::disconnect(self)
    }
}

impl ConnectionEvents for Session {
    fn on_buffer_received(&self, buffer: PooledBuffer, channel: u8, delivery_mode: DeliveryMode) {
        self.handle_incoming_buffer(buffer, channel, delivery_mode);
    }

    fn on_disconnected(&self, error: Option<ProtocolError>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match &error {
            Some(e) => debug!(session_id = self.id, error = %e, "Connection lost"),
            None => debug!(session_id = self.id, "Connection closed by peer"),
        }
        self.report_disconnection(false, error.as_ref());
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("stats", &self.stats())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
