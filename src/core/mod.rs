//! # Core Framing
//!
//! The envelope wire format and its reference-counted in-memory form.
//!
//! ## Wire Format
//! ```text
//! [Tag(2)] [Channel(1)] [DeliveryMode(1)] [Length(4)] [Payload(N)]
//! ```
//!
//! Buffers shorter than the 8-byte header are rejected before any field is read.

pub mod envelope;
