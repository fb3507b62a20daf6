//! # Utility Modules
//!
//! Supporting utilities shared by every session.
//!
//! ## Components
//! - **Buffer Pool**: recycled frame buffers backing envelopes
//! - **Metrics**: counters and duration histograms behind a pluggable sink
//! - **Logging**: tracing-subscriber setup

pub mod buffer_pool;
pub mod logging;
pub mod metrics;

pub use buffer_pool::{BufferPool, PooledBuffer};
pub use metrics::{MetricsRegistry, MetricsSink};
