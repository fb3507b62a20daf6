//! # peer-session
//!
//! Per-connection session layer for multiplayer message servers.
//!
//! A [`Session`](service::session::Session) owns one peer's transport
//! connection, turns inbound buffers into tagged [`Envelope`](core::envelope::Envelope)s,
//! strikes peers that send malformed frames or reserved control tags, and
//! relays everything else to handlers on the server's owning thread.
//!
//! ## Modules
//! - [`core`]: envelope framing
//! - [`protocol`]: dispatcher, event fan-out, moderation policy
//! - [`service`]: the session itself
//! - [`transport`]: collaborator traits (connection, registry)
//! - [`utils`]: buffer pool, metrics, logging
//! - [`config`], [`error`]

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::core::envelope::{DeliveryMode, Envelope, Tag};
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::moderation::{Strike, StrikeReason};
pub use crate::service::session::{Session, SessionContext};
