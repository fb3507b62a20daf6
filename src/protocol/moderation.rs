//! # Moderation Policy
//!
//! Strike accumulation and enforcement for one session.
//!
//! ## Flow
//! 1. A strike is issued (protocol violation or plugin request).
//! 2. With no strike handlers registered the verdict is applied immediately.
//! 3. Otherwise the handlers run on the owning context via the dispatcher. A
//!    completion continuation then applies the verdict unless every handler
//!    succeeded and the strike was forgiven. A failing handler fails closed.
//! 4. Applying adds the weight to the session's unforgiven total; once the
//!    total reaches `strike_threshold` the session is disconnected.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::ModerationConfig;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::events::{EventHandlers, StrikeEvent};
use crate::utils::metrics::{Counter, MetricsSink};

/// Why a strike was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrikeReason {
    /// Inbound buffer could not be decoded as an envelope
    InvalidFrame,
    /// Peer sent a reserved control tag
    DisallowedCommand,
    /// Issued by application code
    PluginRequested,
}

impl fmt::Display for StrikeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StrikeReason::InvalidFrame => "invalid-frame",
            StrikeReason::DisallowedCommand => "disallowed-command",
            StrikeReason::PluginRequested => "plugin-requested",
        })
    }
}

/// A recorded violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Strike {
    pub reason: StrikeReason,
    pub detail: Option<String>,
    pub weight: u32,
}

impl Strike {
    /// A weight of 0 is raised to 1: every strike counts toward the threshold.
    pub fn new(reason: StrikeReason, detail: Option<String>, weight: u32) -> Self {
        Self {
            reason,
            detail,
            weight: weight.max(1),
        }
    }
}

/// Something that can be struck: owns a [`ModerationPolicy`] and can be disconnected.
pub trait StrikeTarget: Send + Sync + 'static {
    fn target_id(&self) -> u16;

    fn moderation(&self) -> &ModerationPolicy;

    /// Tear down the target's connection. Returns false if it was already closed.
    fn disconnect(&self) -> bool;
}

/// Per-session strike state machine.
pub struct ModerationPolicy {
    config: ModerationConfig,
    handlers: EventHandlers<StrikeEvent>,
    dispatcher: Arc<dyn Dispatcher>,
    accumulated: AtomicU64,
    issued: Counter,
    enforced: Counter,
    handler_failures: Counter,
}

impl ModerationPolicy {
    pub fn new(
        config: ModerationConfig,
        dispatcher: Arc<dyn Dispatcher>,
        metrics: &dyn MetricsSink,
    ) -> Self {
        Self {
            config,
            handlers: EventHandlers::new("strike_occurred"),
            dispatcher,
            accumulated: AtomicU64::new(0),
            issued: metrics.counter("strikes_issued", "Strikes issued against sessions"),
            enforced: metrics.counter("strikes_enforced", "Strikes that led to enforcement"),
            handler_failures: metrics.counter(
                "strike_event_failures",
                "Strike handlers that returned an error or panicked",
            ),
        }
    }

    /// Strike handlers. Registering one switches strikes to the asynchronous path.
    pub fn handlers(&self) -> &EventHandlers<StrikeEvent> {
        &self.handlers
    }

    pub fn config(&self) -> &ModerationConfig {
        &self.config
    }

    /// Unforgiven weight applied so far.
    pub fn accumulated_weight(&self) -> u64 {
        self.accumulated.load(Ordering::Acquire)
    }

    /// Issue `strike` against `target`. Never blocks.
    pub fn strike<T: StrikeTarget>(target: &Arc<T>, strike: Strike) {
        let policy = target.moderation();
        policy.issued.increment();
        debug!(
            session_id = target.target_id(),
            reason = %strike.reason,
            weight = strike.weight,
            detail = strike.detail.as_deref().unwrap_or(""),
            "Strike issued"
        );

        if policy.handlers.is_empty() {
            policy.apply(target.as_ref(), &strike);
            return;
        }

        let event = Arc::new(StrikeEvent::new(strike));
        let (work_target, work_event) = (Arc::clone(target), Arc::clone(&event));
        let after_target = Arc::clone(target);

        policy.dispatcher.dispatch_if_needed_then(
            Box::new(move || -> Result<()> { work_target.moderation().notify(&work_event) }),
            Box::new(move |outcome: Result<()>| {
                after_target
                    .moderation()
                    .resolve(after_target.as_ref(), &event, outcome);
            }),
        );
    }

    /// Disconnect `target` for `strike`, unconditionally.
    pub fn enforce<T: StrikeTarget + ?Sized>(&self, target: &T, strike: &Strike) -> bool {
        self.enforced.increment();
        info!(
            session_id = target.target_id(),
            reason = %strike.reason,
            weight = strike.weight,
            detail = strike.detail.as_deref().unwrap_or(""),
            "Enforcing strike, disconnecting session"
        );
        target.disconnect()
    }

    fn notify(&self, event: &StrikeEvent) -> Result<()> {
        let failures = self.handlers.invoke(event);
        if failures.is_empty() {
            return Ok(());
        }
        for _ in &failures {
            self.handler_failures.increment();
        }
        Err(ProtocolError::HandlerFailed(format!(
            "{} ({} of {})",
            constants::ERR_SUBSCRIBER_FAILED,
            failures.len(),
            self.handlers.len().max(failures.len())
        )))
    }

    fn resolve<T: StrikeTarget + ?Sized>(&self, target: &T, event: &StrikeEvent, outcome: Result<()>) {
        match outcome {
            Ok(()) if event.is_forgiven() => {
                info!(
                    session_id = target.target_id(),
                    reason = %event.reason(),
                    "Strike forgiven by handler"
                );
            }
            Ok(()) => self.apply(target, event.strike()),
            Err(e) => {
                warn!(
                    session_id = target.target_id(),
                    error = %e,
                    "Strike handler failed, strike stands"
                );
                self.apply(target, event.strike());
            }
        }
    }

    fn apply<T: StrikeTarget + ?Sized>(&self, target: &T, strike: &Strike) {
        let total = self
            .accumulated
            .fetch_add(u64::from(strike.weight), Ordering::AcqRel)
            + u64::from(strike.weight);

        if total >= u64::from(self.config.strike_threshold) {
            self.enforce(target, strike);
        } else {
            debug!(
                session_id = target.target_id(),
                total,
                threshold = self.config.strike_threshold,
                "Strike recorded below threshold"
            );
        }
    }
}

impl fmt::Debug for ModerationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModerationPolicy")
            .field("config", &self.config)
            .field("handlers", &self.handlers)
            .field("accumulated", &self.accumulated_weight())
            .finish()
    }
}
