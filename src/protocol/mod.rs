//! # Session Protocol
//!
//! How a session hands work to the owning context and decides on strikes.
//!
//! ## Components
//! - **Dispatcher**: marshals work onto the owning thread, with optional completion
//! - **Events**: ordered observer lists and the event payloads they receive
//! - **Moderation**: strike accumulation, forgiveness and enforcement

pub mod dispatcher;
pub mod events;
pub mod moderation;
