//! Everything a connector shares with its siblings, passed in explicitly.

use std::sync::Arc;

use jobline_core::{Clock, SystemClock};
use jobline_observability::{ErrorReporter, MetricsSink, NoopMetrics, TracingErrorReporter};

use crate::broker::{Broker, InMemoryBroker};
use crate::dead_letter::{DeadLetterQueue, InMemoryListStore, ListStore};
use crate::health::HealthRegistry;
use crate::idempotency::{DEFAULT_IDEMPOTENCY_TTL, IdempotencyStore, InMemoryIdempotencyStore};
use crate::partition::{ConsumerRegistry, InMemoryConsumerRegistry};
use crate::pool::PoolRegistry;

/// Shared collaborators of every connector built from it. Cloning is cheap
/// and clones share state (pools, stores, health).
#[derive(Clone)]
pub struct ConnectorContext {
    pub broker: Arc<dyn Broker>,
    pub pools: Arc<PoolRegistry>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub dead_letters: Arc<DeadLetterQueue>,
    pub health: Arc<HealthRegistry>,
    pub consumers: Arc<dyn ConsumerRegistry>,
    pub metrics: Arc<dyn MetricsSink>,
    pub reporter: Arc<dyn ErrorReporter>,
    pub clock: Arc<dyn Clock>,
}

impl ConnectorContext {
    pub fn builder(broker: Arc<dyn Broker>) -> ConnectorContextBuilder {
        ConnectorContextBuilder {
            broker,
            idempotency: None,
            dead_letter_store: None,
            consumers: None,
            metrics: None,
            reporter: None,
            clock: None,
        }
    }

    /// Fully in-process wiring for tests/dev.
    pub fn in_memory() -> Self {
        Self::builder(Arc::new(InMemoryBroker::new())).build()
    }
}

impl core::fmt::Debug for ConnectorContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConnectorContext")
            .field("pools", &self.pools)
            .field("dead_letters", &self.dead_letters)
            .finish_non_exhaustive()
    }
}

/// Unset collaborators fall back to in-memory/no-op implementations.
pub struct ConnectorContextBuilder {
    broker: Arc<dyn Broker>,
    idempotency: Option<Arc<dyn IdempotencyStore>>,
    dead_letter_store: Option<Arc<dyn ListStore>>,
    consumers: Option<Arc<dyn ConsumerRegistry>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    reporter: Option<Arc<dyn ErrorReporter>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ConnectorContextBuilder {
    pub fn idempotency(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.idempotency = Some(store);
        self
    }

    pub fn dead_letter_store(mut self, store: Arc<dyn ListStore>) -> Self {
        self.dead_letter_store = Some(store);
        self
    }

    pub fn consumer_registry(mut self, registry: Arc<dyn ConsumerRegistry>) -> Self {
        self.consumers = Some(registry);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> ConnectorContext {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let idempotency = self.idempotency.unwrap_or_else(|| {
            Arc::new(InMemoryIdempotencyStore::new(
                clock.clone(),
                DEFAULT_IDEMPOTENCY_TTL,
            ))
        });
        let dead_letter_store = self
            .dead_letter_store
            .unwrap_or_else(|| Arc::new(InMemoryListStore::new()));

        ConnectorContext {
            broker: self.broker,
            pools: Arc::new(PoolRegistry::new()),
            idempotency,
            dead_letters: Arc::new(DeadLetterQueue::new(dead_letter_store, clock.clone())),
            health: Arc::new(HealthRegistry::new(clock.clone())),
            consumers: self
                .consumers
                .unwrap_or_else(|| Arc::new(InMemoryConsumerRegistry::new())),
            metrics: self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics)),
            reporter: self
                .reporter
                .unwrap_or_else(|| Arc::new(TracingErrorReporter::new())),
            clock,
        }
    }
}
