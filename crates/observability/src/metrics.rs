//! Prometheus metrics for the queue connector.
//!
//! The connector only talks to the [`MetricsSink`] trait; the scrape endpoint
//! (outside this workspace) renders [`MetricsCollector::render`].

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// Countable queue events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueCounter {
    Pushed,
    PushFailed,
    Popped,
    DuplicateSkipped,
    DelayRequeued,
    DelayPromoted,
    Deleted,
    Released,
    Failed,
    DeadLettered,
    Malformed,
    Rebalanced,
    PollErrors,
}

impl QueueCounter {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueCounter::Pushed => "pushed",
            QueueCounter::PushFailed => "push_failed",
            QueueCounter::Popped => "popped",
            QueueCounter::DuplicateSkipped => "duplicate_skipped",
            QueueCounter::DelayRequeued => "delay_requeued",
            QueueCounter::DelayPromoted => "delay_promoted",
            QueueCounter::Deleted => "deleted",
            QueueCounter::Released => "released",
            QueueCounter::Failed => "failed",
            QueueCounter::DeadLettered => "dead_lettered",
            QueueCounter::Malformed => "malformed",
            QueueCounter::Rebalanced => "rebalanced",
            QueueCounter::PollErrors => "poll_errors",
        }
    }
}

/// Injected metrics interface.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, counter: QueueCounter, queue: &str);

    fn set_assigned_partitions(&self, topic: &str, count: i64);

    /// `state` is one of `created`, `idle`, `using`.
    fn set_pool_connections(&self, pool: &str, state: &str, count: i64);

    fn observe_processing(&self, queue: &str, seconds: f64);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _counter: QueueCounter, _queue: &str) {}

    fn set_assigned_partitions(&self, _topic: &str, _count: i64) {}

    fn set_pool_connections(&self, _pool: &str, _state: &str, _count: i64) {}

    fn observe_processing(&self, _queue: &str, _seconds: f64) {}
}

/// Prometheus-backed collector.
pub struct MetricsCollector {
    registry: Registry,
    events: IntCounterVec,
    assigned_partitions: IntGaugeVec,
    pool_connections: IntGaugeVec,
    processing_seconds: HistogramVec,
}

impl MetricsCollector {
    /// # Panics
    ///
    /// Panics if metric registration fails (names are static and unique).
    pub fn new() -> Self {
        let registry = Registry::new();

        let events = IntCounterVec::new(
            Opts::new("jobline_queue_events_total", "Queue events by kind and queue"),
            &["event", "queue"],
        )
        .expect("metric creation should succeed");

        let assigned_partitions = IntGaugeVec::new(
            Opts::new(
                "jobline_assigned_partitions",
                "Partitions currently assigned to this consumer",
            ),
            &["topic"],
        )
        .expect("metric creation should succeed");

        let pool_connections = IntGaugeVec::new(
            Opts::new("jobline_pool_connections", "Producer pool connections by state"),
            &["pool", "state"],
        )
        .expect("metric creation should succeed");

        let processing_seconds = HistogramVec::new(
            HistogramOpts::new(
                "jobline_job_processing_seconds",
                "Time from delivery to acknowledgement",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["queue"],
        )
        .expect("metric creation should succeed");

        registry
            .register(Box::new(events.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(assigned_partitions.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(pool_connections.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(processing_seconds.clone()))
            .expect("metric registration should succeed");

        Self {
            registry,
            events,
            assigned_partitions,
            pool_connections,
            processing_seconds,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current value of one event counter.
    pub fn count(&self, counter: QueueCounter, queue: &str) -> u64 {
        self.events
            .with_label_values(&[counter.as_str(), queue])
            .get()
    }

    pub fn assigned_partitions(&self, topic: &str) -> i64 {
        self.assigned_partitions.with_label_values(&[topic]).get()
    }

    /// Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MetricsCollector").finish_non_exhaustive()
    }
}

impl MetricsSink for MetricsCollector {
    fn increment(&self, counter: QueueCounter, queue: &str) {
        self.events
            .with_label_values(&[counter.as_str(), queue])
            .inc();
    }

    fn set_assigned_partitions(&self, topic: &str, count: i64) {
        self.assigned_partitions.with_label_values(&[topic]).set(count);
    }

    fn set_pool_connections(&self, pool: &str, state: &str, count: i64) {
        self.pool_connections
            .with_label_values(&[pool, state])
            .set(count);
    }

    fn observe_processing(&self, queue: &str, seconds: f64) {
        self.processing_seconds
            .with_label_values(&[queue])
            .observe(seconds);
    }
}
