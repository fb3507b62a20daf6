//! # Session Service
//!
//! The per-peer session object and the context it is built from.

pub mod session;
