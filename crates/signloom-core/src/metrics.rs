//! Metrics emission seam
//!
//! The dispatcher depends only on the narrow [`MetricsSink`] capability, not
//! on a concrete metrics backend. The default implementation emits
//! structured `tracing` events that a subscriber can forward anywhere.

use std::sync::Arc;
use tracing::info;

/// Counter and gauge emission, labeled by request type / modality / handler
pub trait MetricsSink: Send + Sync {
    /// Increment a counter by one
    fn incr_counter(&self, name: &str, labels: &[(&str, &str)]);

    /// Observe a millisecond-valued gauge
    fn observe_ms(&self, name: &str, labels: &[(&str, &str)], value_ms: u64);
}

/// Default sink: structured `tracing` events at info level
#[derive(Debug, Default, Clone)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn incr_counter(&self, name: &str, labels: &[(&str, &str)]) {
        info!(metric = name, labels = ?labels, "counter");
    }

    fn observe_ms(&self, name: &str, labels: &[(&str, &str)], value_ms: u64) {
        info!(metric = name, labels = ?labels, value_ms, "gauge");
    }
}

/// Sink that drops everything, for tests and benchmarks
#[derive(Debug, Default, Clone)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn incr_counter(&self, _name: &str, _labels: &[(&str, &str)]) {}
    fn observe_ms(&self, _name: &str, _labels: &[(&str, &str)], _value_ms: u64) {}
}

/// Shared sink handle used across the dispatcher
pub type SharedMetrics = Arc<dyn MetricsSink>;
