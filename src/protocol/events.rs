//! Subscriber-facing notification points.
//!
//! [`EventHandlers`] is an ordered list of observers. Invocation walks the list
//! in registration order; an observer that returns an error or panics is logged
//! and skipped, and the next one still runs.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::error;

use crate::core::envelope::{DeliveryMode, Envelope};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::moderation::{Strike, StrikeReason};
use crate::service::session::Session;

type HandlerFn<E> = dyn Fn(&E) -> Result<()> + Send + Sync + 'static;

/// Token returned by [`EventHandlers::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Registration-ordered observer list for events of type `E`.
pub struct EventHandlers<E> {
    name: &'static str,
    handlers: RwLock<Vec<(HandlerId, Arc<HandlerFn<E>>)>>,
    next_id: AtomicU64,
}

impl<E> EventHandlers<E> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> Result<HandlerId>
    where
        F: Fn(&E) -> Result<()> + Send + Sync + 'static,
    {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_HANDLERS_WRITE_LOCK.to_string()))?;

        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        handlers.push((id, Arc::new(handler)));
        Ok(id)
    }

    /// Remove a handler. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: HandlerId) -> Result<bool> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_HANDLERS_WRITE_LOCK.to_string()))?;

        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        Ok(handlers.len() != before)
    }

    pub fn len(&self) -> usize {
        self.handlers.read().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every handler with `event`. Returns the errors of those that failed.
    pub fn invoke(&self, event: &E) -> Vec<ProtocolError> {
        // Snapshot so handlers may (un)subscribe while being invoked
        let snapshot: Vec<Arc<HandlerFn<E>>> = match self.handlers.read() {
            Ok(handlers) => handlers.iter().map(|(_, h)| Arc::clone(h)).collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .map(|(_, h)| Arc::clone(h))
                .collect(),
        };

        let mut failures = Vec::new();
        for (index, handler) in snapshot.iter().enumerate() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(event)))
                .unwrap_or_else(|p| Err(ProtocolError::from_panic(p)));
            if let Err(e) = outcome {
                error!(event = self.name, handler = index, error = %e, "Event handler failed");
                failures.push(e);
            }
        }
        failures
    }
}

impl<E> fmt::Debug for EventHandlers<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}

/// An accepted application envelope, delivered on the owning context.
///
/// The envelope is this event's own duplicate; it is released when the event
/// is dropped after the last handler returns.
pub struct MessageReceivedEvent {
    pub envelope: Envelope,
    pub channel: u8,
    pub delivery_mode: DeliveryMode,
    pub session: Arc<Session>,
}

/// A strike awaiting a verdict. Any handler may forgive it.
#[derive(Debug)]
pub struct StrikeEvent {
    strike: Strike,
    forgiven: AtomicBool,
}

impl StrikeEvent {
    pub fn new(strike: Strike) -> Self {
        Self {
            strike,
            forgiven: AtomicBool::new(false),
        }
    }

    pub fn strike(&self) -> &Strike {
        &self.strike
    }

    pub fn reason(&self) -> StrikeReason {
        self.strike.reason
    }

    pub fn detail(&self) -> Option<&str> {
        self.strike.detail.as_deref()
    }

    pub fn weight(&self) -> u32 {
        self.strike.weight
    }

    pub fn forgive(&self) {
        self.set_forgiven(true);
    }

    pub fn set_forgiven(&self, forgiven: bool) {
        self.forgiven.store(forgiven, Ordering::Release);
    }

    pub fn is_forgiven(&self) -> bool {
        self.forgiven.load(Ordering::Acquire)
    }
}
