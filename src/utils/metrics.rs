//! Observability and Metrics
//!
//! Sessions report through the [`MetricsSink`] trait so that any backend can be
//! plugged in. [`MetricsRegistry`] is the in-process implementation: named
//! atomic counters and duration histograms that can be snapshotted and logged.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Backend that hands out named metric handles.
pub trait MetricsSink: Send + Sync {
    /// Monotonically increasing counter. Repeated calls with the same name share state.
    fn counter(&self, name: &'static str, description: &'static str) -> Counter;

    /// Duration histogram. Repeated calls with the same name share state.
    fn histogram(&self, name: &'static str, description: &'static str) -> Histogram;
}

/// Cheap, cloneable handle to a counter
#[derive(Debug, Clone, Default)]
pub struct Counter {
    value: Arc<AtomicU64>,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct HistogramState {
    count: AtomicU64,
    sum_micros: AtomicU64,
    max_micros: AtomicU64,
}

/// Cheap, cloneable handle to a duration histogram
#[derive(Debug, Clone, Default)]
pub struct Histogram {
    state: Arc<HistogramState>,
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observation, in seconds. Negative, NaN and overflowing values are dropped.
    pub fn report(&self, seconds: f64) {
        match Duration::try_from_secs_f64(seconds) {
            Ok(duration) => self.record(duration),
            Err(_) => debug!(seconds, "Dropping unrepresentable histogram observation"),
        }
    }

    /// Record one observation
    pub fn record(&self, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.state.count.fetch_add(1, Ordering::Relaxed);
        self.state.sum_micros.fetch_add(micros, Ordering::Relaxed);
        self.state.max_micros.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.state.count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count(),
            sum: Duration::from_micros(self.state.sum_micros.load(Ordering::Relaxed)),
            max: Duration::from_micros(self.state.max_micros.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time view of a histogram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: Duration,
    pub max: Duration,
}

impl HistogramSnapshot {
    pub fn mean(&self) -> Option<Duration> {
        let sum_micros = u64::try_from(self.sum.as_micros()).unwrap_or(u64::MAX);
        (self.count > 0).then(|| Duration::from_micros(sum_micros / self.count))
    }
}

/// In-process metrics collector
#[derive(Debug)]
pub struct MetricsRegistry {
    counters: Mutex<BTreeMap<&'static str, (&'static str, Counter)>>,
    histograms: Mutex<BTreeMap<&'static str, (&'static str, Histogram)>>,
    start_time: Instant,
}

impl MetricsRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(BTreeMap::new()),
            histograms: Mutex::new(BTreeMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Current value of a counter, if it has been registered
    pub fn counter_value(&self, name: &str) -> Option<u64> {
        let counters = self.counters.lock().ok()?;
        counters.get(name).map(|(_, c)| c.get())
    }

    /// Current state of a histogram, if it has been registered
    pub fn histogram_snapshot(&self, name: &str) -> Option<HistogramSnapshot> {
        let histograms = self.histograms.lock().ok()?;
        histograms.get(name).map(|(_, h)| h.snapshot())
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .lock()
            .map(|m| m.iter().map(|(k, (_, c))| (*k, c.get())).collect())
            .unwrap_or_default();
        let histograms = self
            .histograms
            .lock()
            .map(|m| m.iter().map(|(k, (_, h))| (*k, h.snapshot())).collect())
            .unwrap_or_default();

        MetricsSnapshot {
            counters,
            histograms,
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        for (name, value) in &snapshot.counters {
            info!(metric = *name, value = *value, "counter");
        }
        for (name, h) in &snapshot.histograms {
            info!(
                metric = *name,
                count = h.count,
                mean_us = h.mean().map(|d| d.as_micros() as u64).unwrap_or(0),
                max_us = h.max.as_micros() as u64,
                "histogram"
            );
        }
        info!(uptime_seconds = snapshot.uptime_seconds, "Session metrics snapshot");
    }
}

impl MetricsSink for MetricsRegistry {
    fn counter(&self, name: &'static str, description: &'static str) -> Counter {
        match self.counters.lock() {
            Ok(mut counters) => counters
                .entry(name)
                .or_insert_with(|| (description, Counter::new()))
                .1
                .clone(),
            // Poisoned: hand out a detached counter rather than failing the caller
            Err(_) => Counter::new(),
        }
    }

    fn histogram(&self, name: &'static str, description: &'static str) -> Histogram {
        match self.histograms.lock() {
            Ok(mut histograms) => histograms
                .entry(name)
                .or_insert_with(|| (description, Histogram::new()))
                .1
                .clone(),
            Err(_) => Histogram::new(),
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<&'static str, u64>,
    pub histograms: BTreeMap<&'static str, HistogramSnapshot>,
    pub uptime_seconds: u64,
}

/// Global metrics instance (lazy static for simplicity)
static METRICS: once_cell::sync::Lazy<Arc<MetricsRegistry>> =
    once_cell::sync::Lazy::new(|| Arc::new(MetricsRegistry::new()));

/// Get the global metrics instance
pub fn global_metrics() -> Arc<MetricsRegistry> {
    Arc::clone(&METRICS)
}

/// Initialize metrics collection (call once at startup)
pub fn init_metrics() {
    let _ = global_metrics();
    info!("Metrics collection initialized");
}

/// Measures an operation and reports it to a histogram only when stopped.
///
/// Dropping a timer without calling [`Timer::stop`] discards the measurement.
pub struct Timer {
    start: Instant,
    histogram: Histogram,
    operation: &'static str,
    stopped: bool,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str, histogram: Histogram) -> Self {
        Self {
            start: Instant::now(),
            histogram,
            operation,
            stopped: false,
        }
    }

    /// Report the elapsed time and return it
    pub fn stop(mut self) -> Duration {
        let elapsed = self.start.elapsed();
        self.histogram.record(elapsed);
        self.stopped = true;
        elapsed
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if !self.stopped {
            debug!(
                operation = self.operation,
                elapsed_us = self.start.elapsed().as_micros() as u64,
                "Timer discarded without reporting"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_shared_by_name() {
        let registry = MetricsRegistry::new();
        let a = registry.counter("messages_sent", "sent");
        let b = registry.counter("messages_sent", "sent");
        a.increment();
        b.increment();

        assert_eq!(registry.counter_value("messages_sent"), Some(2));
        assert_eq!(registry.counter_value("missing"), None);
    }

    #[test]
    fn histogram_tracks_count_sum_and_max() {
        let registry = MetricsRegistry::new();
        let h = registry.histogram("event_time", "time");
        h.record(Duration::from_millis(2));
        h.report(0.004);

        let snap = registry.histogram_snapshot("event_time").unwrap();
        assert_eq!(snap.count, 2);
        assert_eq!(snap.max, Duration::from_millis(4));
        assert_eq!(snap.mean(), Some(Duration::from_millis(3)));
    }

    #[test]
    fn timer_reports_only_when_stopped() {
        let h = Histogram::new();
        drop(Timer::start("discarded", h.clone()));
        assert_eq!(h.count(), 0);

        Timer::start("kept", h.clone()).stop();
        assert_eq!(h.count(), 1);
    }

    #[test]
    fn snapshot_lists_registered_metrics() {
        let registry = MetricsRegistry::new();
        registry.counter("a", "").increment();
        registry.histogram("b", "");

        let snap = registry.snapshot();
        assert_eq!(snap.counters.get("a"), Some(&1));
        assert_eq!(snap.histograms.get("b").map(|h| h.count), Some(0));
    }

    #[test]
    fn global_registry_is_shared() {
        init_metrics();
        let sink: Arc<dyn MetricsSink> = global_metrics();
        sink.counter("global_test_counter", "").increment();

        assert_eq!(global_metrics().counter_value("global_test_counter"), Some(1));
        global_metrics().log_metrics();
    }

    #[test]
    fn unrepresentable_reports_are_dropped() {
        let h = Histogram::new();
        h.report(f64::INFINITY);
        h.report(f64::NAN);
        h.report(-1.0);
        assert_eq!(h.count(), 0);

        h.report(0.5);
        assert_eq!(h.snapshot().max, Duration::from_millis(500));
    }

    #[test]
    fn mean_handles_counts_beyond_u32() {
        let snap = HistogramSnapshot {
            count: u64::from(u32::MAX) + 1,
            sum: Duration::from_micros((u64::from(u32::MAX) + 1) * 3),
            max: Duration::from_micros(3),
        };
        assert_eq!(snap.mean(), Some(Duration::from_micros(3)));

        let empty = HistogramSnapshot {
            count: 0,
            sum: Duration::ZERO,
            max: Duration::ZERO,
        };
        assert_eq!(empty.mean(), None);
    }
}
