//! Tracing, logging, metrics and error reporting (shared setup).

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Queue counters/gauges and the prometheus-backed collector.
pub mod metrics;

/// Structured error capture.
pub mod reporter;

pub use metrics::{MetricsCollector, MetricsSink, NoopMetrics, QueueCounter};
pub use reporter::{ErrorContext, ErrorReport, ErrorReporter, TracingErrorReporter};
