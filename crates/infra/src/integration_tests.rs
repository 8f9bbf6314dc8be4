//! Integration tests for the full connector pipeline.
//!
//! Tests: push/later → InMemoryBroker → pop → Job → delete/release/fail
//!
//! Verifies:
//! - Delivered jobs are acknowledged exactly once and never resurface
//! - Delayed jobs stay hidden until due, then move to the live queue once
//! - Exhausted retries end up in the dead-letter queue
//! - Partition ownership is split between live instances and reclaimed
//! - Configuration written through any backend reads back the same

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use proptest::prelude::*;
    use serde_json::json;
    use uuid::Uuid;

    use jobline_core::{
        Clock, ConsumerIdentity, Envelope, JobData, ManualClock, QueueError, TenantId,
    };
    use jobline_observability::{MetricsCollector, QueueCounter, TracingErrorReporter};
    use jobline_queue::{
        HandlerRegistry, JobHandle, JobResult, Queue, QueueWorker, ReleaseOutcome, WorkerConfig,
    };

    use crate::broker::{Broker, InMemoryBroker, TopicPartition};
    use crate::config::{
        CachedConfigProvider, ConfigBackend, ConfigProvider, ConnectorConfig, ConsulConfigBackend,
        EtcdConfigBackend, InMemoryConfigBackend, InMemoryConsulKv, InMemoryEtcdKv,
        InMemoryZnodeTree, ZookeeperConfigBackend,
    };
    use crate::connector::{Job, KafkaConnector};
    use crate::context::ConnectorContext;
    use crate::health::HealthStatus;
    use crate::partition::{InMemoryConsumerRegistry, PartitionManager};

    const GROUP: &str = "jobline";
    const MAX_POPS: usize = 32;

    struct Harness {
        broker: Arc<InMemoryBroker>,
        clock: Arc<ManualClock>,
        metrics: Arc<MetricsCollector>,
        reporter: Arc<TracingErrorReporter>,
        ctx: ConnectorContext,
    }

    fn setup() -> Harness {
        let broker = Arc::new(InMemoryBroker::new());
        let clock = Arc::new(ManualClock::starting_now());
        let metrics = Arc::new(MetricsCollector::new());
        let reporter = Arc::new(TracingErrorReporter::new());
        let ctx = ConnectorContext::builder(broker.clone())
            .clock(clock.clone())
            .metrics(metrics.clone())
            .reporter(reporter.clone())
            .build();
        Harness {
            broker,
            clock,
            metrics,
            reporter,
            ctx,
        }
    }

    fn connector(h: &Harness) -> KafkaConnector {
        KafkaConnector::new(ConnectorConfig::default(), h.ctx.clone()).unwrap()
    }

    /// Pop until a job surfaces; redirects and skips return `None` first.
    fn pop_next<'c>(c: &'c KafkaConnector, queue: &str) -> Option<Job<'c>> {
        for _ in 0..MAX_POPS {
            if let Some(job) = c.pop(Some(queue)).unwrap() {
                return Some(job);
            }
        }
        None
    }

    fn assert_nothing_delivered(c: &KafkaConnector, queue: &str) {
        for _ in 0..MAX_POPS {
            assert!(c.pop(Some(queue)).unwrap().is_none());
        }
    }

    #[test]
    fn pushed_job_is_delivered_once_and_deleted_for_good() {
        let h = setup();
        let c = connector(&h);

        let id = c
            .push("SendEmail", json!({"to": "a@b.com"}), Some("mail"))
            .unwrap();

        let job = pop_next(&c, "mail").expect("job delivered");
        assert_eq!(job.id(), &id);
        assert_eq!(job.name(), "SendEmail");
        assert_eq!(job.attempts(), 0);
        assert_eq!(job.data()["to"], json!("a@b.com"));
        assert_eq!(job.queue(), "mail");
        job.delete().unwrap();

        assert!(c.pop(Some("mail")).unwrap().is_none());
        assert_eq!(h.broker.lag(GROUP, "mail"), 0);
        assert_eq!(h.metrics.count(QueueCounter::Deleted, "mail"), 1);
        assert_eq!(c.size(Some("mail")), 0);
    }

    #[test]
    fn push_without_queue_uses_the_default_queue() {
        let h = setup();
        let c = connector(&h);

        c.push("Ping", json!(null), None).unwrap();
        assert_eq!(h.broker.topic_len("default"), 1);

        let job = pop_next(&c, "default").expect("job delivered");
        assert!(job.data().is_empty());
        job.delete().unwrap();
    }

    #[test]
    fn delayed_job_stays_hidden_until_due_and_moves_once() {
        let h = setup();
        let c = connector(&h);

        c.later(Duration::from_secs(60), "Reminder", json!({}), Some("reminders"))
            .unwrap();
        assert_eq!(h.broker.topic_len("reminders"), 0);

        // Reading the delayed topic directly only re-queues the record.
        assert!(c.pop(Some("reminders_delayed")).unwrap().is_none());

        assert_nothing_delivered(&c, "reminders");
        h.clock.advance(Duration::from_secs(59));
        assert_nothing_delivered(&c, "reminders");

        h.clock.advance(Duration::from_secs(1));
        let job = pop_next(&c, "reminders").expect("due job delivered");
        assert_eq!(job.name(), "Reminder");
        assert_eq!(job.attempts(), 0);
        job.delete().unwrap();

        assert_eq!(h.broker.topic_len("reminders"), 1);
        assert_eq!(h.metrics.count(QueueCounter::DelayPromoted, "reminders"), 1);
        assert!(h.metrics.count(QueueCounter::DelayRequeued, "reminders") > 0);
        assert_nothing_delivered(&c, "reminders");
    }

    #[test]
    fn repeated_failures_end_in_one_dead_letter() {
        let h = setup();
        let c = connector(&h);
        let id = c.push("ChargeCard", json!({"order": 7}), Some("orders")).unwrap();

        for attempt in 1..=3 {
            let job = pop_next(&c, "orders").expect("job delivered");
            assert_eq!(job.attempts(), attempt - 1);
            assert_eq!(
                job.release(Duration::ZERO).unwrap(),
                ReleaseOutcome::Requeued {
                    attempts: attempt,
                    delay: Duration::ZERO
                }
            );
        }

        let job = pop_next(&c, "orders").expect("job delivered");
        assert_eq!(job.attempts(), 3);
        assert_eq!(
            job.release(Duration::ZERO).unwrap(),
            ReleaseOutcome::DeadLettered { attempts: 4 }
        );

        let dead = h.ctx.dead_letters.get_messages("orders", 0, -1).unwrap();
        assert_eq!(h.ctx.dead_letters.count("orders").unwrap(), 1);
        assert_eq!(dead[0].message_id, id.as_str());
        assert_eq!(dead[0].retry_count, 4);
        assert_eq!(dead[0].payload["job"], json!("ChargeCard"));

        assert_nothing_delivered(&c, "orders");
        assert_eq!(h.broker.lag(GROUP, "orders"), 0);
    }

    #[test]
    fn failed_job_can_be_retried_from_the_dead_letter_queue() {
        let h = setup();
        let c = connector(&h);
        let id = c.push("ChargeCard", json!({"order": 8}), Some("orders")).unwrap();

        pop_next(&c, "orders").unwrap().fail("card declined").unwrap();
        let analysis = h.ctx.dead_letters.analyze_errors("orders").unwrap();
        assert_eq!(analysis.total_messages, 1);
        assert_eq!(analysis.errors[0].error, "card declined");

        let retried = c.retry_dead_letter("orders", 0).unwrap();
        assert_eq!(retried.message_id, id.as_str());
        assert_eq!(h.ctx.dead_letters.count("orders").unwrap(), 0);

        let job = pop_next(&c, "orders").expect("retried job delivered");
        assert_eq!(job.id(), &id);
        assert_eq!(job.attempts(), 0);
        job.delete().unwrap();
    }

    #[test]
    fn released_jobs_back_off_exponentially() {
        let h = setup();
        let c = connector(&h);
        c.push("Sync", json!({}), Some("jobs")).unwrap();

        for (attempt, secs) in [(1, 2), (2, 4), (3, 8)] {
            let job = pop_next(&c, "jobs").expect("job delivered");
            assert_eq!(
                job.release_with_backoff().unwrap(),
                ReleaseOutcome::Requeued {
                    attempts: attempt,
                    delay: Duration::from_secs(secs)
                }
            );

            let parked = h.broker.records("jobs_delayed");
            let parked = Envelope::from_slice(&parked.last().unwrap().payload).unwrap();
            assert_eq!(parked.attempts(), attempt);
            assert_eq!(
                parked.available_at(),
                Some(h.clock.unix_now() + secs as i64)
            );

            h.clock.advance(Duration::from_secs(secs));
        }

        let job = pop_next(&c, "jobs").expect("job delivered");
        assert_eq!(job.attempts(), 3);
        job.delete().unwrap();
    }

    #[test]
    fn duplicate_delivery_is_skipped_and_committed() {
        let h = setup();
        let c = connector(&h);
        let envelope = Envelope::new("SendEmail", JobData::new());
        let bytes = envelope.to_bytes().unwrap();

        c.push_raw(&bytes, Some("mail")).unwrap();
        c.push_raw(&bytes, Some("mail")).unwrap();

        let mut handled = 0;
        for _ in 0..MAX_POPS {
            if let Some(job) = c.pop(Some("mail")).unwrap() {
                assert_eq!(job.id(), envelope.message_id());
                handled += 1;
                job.delete().unwrap();
            }
        }

        assert_eq!(handled, 1);
        assert_eq!(h.metrics.count(QueueCounter::DuplicateSkipped, "mail"), 1);
        assert_eq!(h.broker.lag(GROUP, "mail"), 0);
    }

    #[test]
    fn malformed_payload_is_dead_lettered_with_its_coordinates() {
        let h = setup();
        let c = connector(&h);
        c.push_raw(b"{not json", Some("mail")).unwrap();

        assert_nothing_delivered(&c, "mail");

        let dead = h.ctx.dead_letters.get_messages("mail", 0, -1).unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].message_id.starts_with("mail:"));
        assert_eq!(dead[0].payload, json!("{not json"));
        assert_eq!(h.metrics.count(QueueCounter::Malformed, "mail"), 1);
        assert_eq!(h.broker.lag(GROUP, "mail"), 0);
    }

    #[test]
    fn dropped_job_is_delivered_again() {
        let h = setup();
        let c = connector(&h);
        let id = c.push("Resize", json!({"w": 10}), Some("images")).unwrap();

        let job = pop_next(&c, "images").unwrap();
        drop(job);

        let again = pop_next(&c, "images").expect("job redelivered");
        assert_eq!(again.id(), &id);
        again.delete().unwrap();
    }

    #[test]
    fn two_instances_split_partitions_and_survivor_reclaims_them() {
        let h = setup();
        h.broker.create_topic("orders", 4, 1).unwrap();
        let a = connector(&h);
        let b = connector(&h);

        let owned = |c: &KafkaConnector| -> BTreeSet<i32> {
            c.assigned_partitions()
                .into_iter()
                .filter(|tp| tp.topic == "orders")
                .map(|tp| tp.partition)
                .collect()
        };

        assert!(a.pop(Some("orders")).unwrap().is_none());
        assert!(b.pop(Some("orders")).unwrap().is_none());
        assert_eq!(owned(&b).len(), 2);

        // `a` claimed everything before `b` existed; its next check gives
        // half back.
        h.clock.advance(Duration::from_secs(30));
        assert!(a.pop(Some("orders")).unwrap().is_none());
        assert_eq!(owned(&a).len(), 2);
        assert!(owned(&a).is_disjoint(&owned(&b)));
        let union: BTreeSet<i32> = owned(&a).union(&owned(&b)).copied().collect();
        assert_eq!(union, BTreeSet::from([0, 1, 2, 3]));

        b.shutdown();
        h.clock.advance(Duration::from_secs(30));
        assert!(a.pop(Some("orders")).unwrap().is_none());
        assert_eq!(owned(&a), BTreeSet::from([0, 1, 2, 3]));
        assert!(h.metrics.count(QueueCounter::Rebalanced, "orders") >= 2);
    }

    #[test]
    fn consumer_cycling_delayed_records_stays_registered() {
        let h = setup();
        let a = connector(&h);
        a.later(Duration::from_secs(600), "Reminder", json!({}), Some("r"))
            .unwrap();

        // Every poll hands back the parked record, so no poll is ever empty.
        for _ in 0..12 {
            for _ in 0..3 {
                assert!(a.pop(Some("r")).unwrap().is_none());
            }
            h.clock.advance(Duration::from_secs(10));
        }

        let manager = PartitionManager::new(
            h.ctx.consumers.clone(),
            h.clock.clone(),
            Duration::from_secs(30),
            Duration::from_secs(90),
        );
        for topic in ["r", "r_delayed"] {
            let live = manager.active_consumers(topic).unwrap();
            assert!(live.contains(&a.identity().key()), "{topic}: {live:?}");
        }

        let b = connector(&h);
        assert!(b.pop(Some("r")).unwrap().is_none());
        h.clock.advance(Duration::from_secs(30));
        assert!(a.pop(Some("r")).unwrap().is_none());

        let owned_a: BTreeSet<TopicPartition> = a.assigned_partitions().into_iter().collect();
        let owned_b: BTreeSet<TopicPartition> = b.assigned_partitions().into_iter().collect();
        assert!(owned_a.is_disjoint(&owned_b), "{owned_a:?} / {owned_b:?}");

        let all: BTreeSet<TopicPartition> = ["r", "r_delayed"]
            .into_iter()
            .flat_map(|t| (0..3).map(move |p| TopicPartition::new(t, p)))
            .collect();
        let union: BTreeSet<TopicPartition> = owned_a.union(&owned_b).cloned().collect();
        assert_eq!(union, all);
    }

    #[test]
    fn shutdown_stops_delivery_but_lets_in_flight_jobs_finish() {
        let h = setup();
        let c = connector(&h);
        c.push("A", json!({}), Some("mail")).unwrap();
        c.push("B", json!({}), Some("mail")).unwrap();

        let job = pop_next(&c, "mail").unwrap();
        c.shutdown();
        assert!(c.is_shutting_down());
        job.delete().unwrap();

        for _ in 0..MAX_POPS {
            assert!(c.pop(Some("mail")).unwrap().is_none());
        }
        h.clock.advance(Duration::from_secs(120));
        assert!(c.pop(Some("mail")).unwrap().is_none());

        assert!(c.assigned_partitions().is_empty());
        assert!(h.ctx.consumers.active("mail", 0).unwrap().is_empty());
        assert_eq!(h.broker.lag(GROUP, "mail"), 1);
        assert_eq!(h.metrics.count(QueueCounter::Rebalanced, "mail"), 0);

        c.shutdown();
        assert_eq!(c.health().unwrap().status, HealthStatus::ShuttingDown);
    }

    #[test]
    fn transactional_push_commits_and_creates_missing_topic() {
        let h = setup();
        let config = ConnectorConfig {
            transactional_id: Some("orders-tx".to_string()),
            ..ConnectorConfig::default()
        };
        let c = KafkaConnector::new(config, h.ctx.clone()).unwrap();

        let id = c.push("Ship", json!({"order": 1}), Some("orders")).unwrap();
        assert_eq!(h.broker.partitions("orders"), Some(3));
        assert_eq!(h.broker.topic_len("orders"), 1);

        let job = pop_next(&c, "orders").unwrap();
        assert_eq!(job.id(), &id);
        job.delete().unwrap();
    }

    #[test]
    fn unknown_topic_without_auto_create_is_a_broker_error() {
        let h = setup();
        let config = ConnectorConfig {
            auto_create_topics: false,
            ..ConnectorConfig::default()
        };
        let c = KafkaConnector::new(config, h.ctx.clone()).unwrap();

        let err = c.push("X", json!({}), Some("missing")).unwrap_err();
        assert!(matches!(err, QueueError::BrokerUnavailable(_)));
        assert!(c.pop(Some("missing")).is_err());
        assert!(h.broker.partitions("missing").is_none());
        assert_eq!(h.metrics.count(QueueCounter::PushFailed, "missing"), 1);
    }

    #[test]
    fn broker_outage_is_reported_and_recoverable() {
        let h = setup();
        let c = connector(&h);
        c.push("Warmup", json!({}), Some("mail")).unwrap();
        pop_next(&c, "mail").unwrap().delete().unwrap();

        h.broker.set_available(false);
        let err = c.push("X", json!({}), Some("mail")).unwrap_err();
        assert!(err.is_retriable());
        assert!(c.pop(Some("mail")).is_err());
        assert_eq!(c.health().unwrap().status, HealthStatus::Error);
        assert!(h.reporter.recent().iter().any(|r| r.context.action == "push"));
        assert!(h.reporter.recent().iter().any(|r| r.context.action == "poll"));

        h.broker.set_available(true);
        let id = c.push("X", json!({}), Some("mail")).unwrap();
        let job = pop_next(&c, "mail").expect("delivery resumes");
        assert_eq!(job.id(), &id);
        job.delete().unwrap();
        assert_eq!(h.broker.topic_len("mail"), 2);
    }

    #[test]
    fn worker_drains_connector_and_stops() {
        let ctx = ConnectorContext::in_memory();
        let c = Arc::new(KafkaConnector::new(ConnectorConfig::default(), ctx).unwrap());
        for n in 0..3 {
            c.push("SendEmail", json!({"n": n}), Some("mail")).unwrap();
        }

        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        let mut handlers = HandlerRegistry::new();
        handlers.register("SendEmail", move |_job| {
            counter.fetch_add(1, Ordering::SeqCst);
            JobResult::Success
        });

        let worker = QueueWorker::new(
            c.clone(),
            handlers,
            WorkerConfig::default().with_name("mail-worker").with_queue("mail"),
        );
        let handle = worker.spawn();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().jobs_succeeded < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        c.shutdown();
        let stats = handle.stats();
        handle.shutdown();

        assert_eq!(handled.load(Ordering::SeqCst), 3);
        assert_eq!(stats.jobs_succeeded, 3);
    }

    fn assert_config_round_trip<B: ConfigBackend + 'static>(backend: B) {
        let backend = Arc::new(backend);
        let clock = Arc::new(ManualClock::starting_now());
        let writer =
            CachedConfigProvider::new(backend.clone(), clock.clone(), Duration::from_secs(60));
        let reader = CachedConfigProvider::new(backend, clock.clone(), Duration::from_secs(60));
        let tenant = TenantId::new("acme");

        assert_eq!(reader.get(&tenant, "kafka.connections.kafka.brokers").unwrap(), None);

        writer
            .set(&tenant, "kafka.connections.kafka.brokers", json!("k1:9092,k2:9092"))
            .unwrap();
        writer
            .set(&tenant, "kafka.connections.kafka.max_attempts", json!(5))
            .unwrap();
        assert_eq!(
            writer.get(&tenant, "kafka.connections.kafka.brokers").unwrap(),
            Some(json!("k1:9092,k2:9092"))
        );

        // A second process sees the write within one refresh interval.
        clock.advance(Duration::from_secs(60));
        assert_eq!(
            reader.get(&tenant, "kafka.connections.kafka.max_attempts").unwrap(),
            Some(json!(5))
        );

        let config = ConnectorConfig::from_provider(&reader, &tenant, "kafka").unwrap();
        assert_eq!(config.brokers, "k1:9092,k2:9092");
        assert_eq!(config.max_attempts, 5);
        config.validate().unwrap();
    }

    #[test]
    fn config_round_trips_through_every_backend() {
        assert_config_round_trip(InMemoryConfigBackend::new());
        assert_config_round_trip(ConsulConfigBackend::new(InMemoryConsulKv::new(), None));
        assert_config_round_trip(EtcdConfigBackend::new(InMemoryEtcdKv::new(), None));
        assert_config_round_trip(ZookeeperConfigBackend::new(InMemoryZnodeTree::new(), None));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: for N live consumers and P partitions, every partition
        /// has exactly one owner.
        #[test]
        fn partitions_are_covered_exactly_once(consumers in 1usize..8, partitions in 1i32..32) {
            let clock = Arc::new(ManualClock::starting_now());
            let manager = PartitionManager::new(
                Arc::new(InMemoryConsumerRegistry::new()),
                clock,
                Duration::from_secs(30),
                Duration::from_secs(90),
            );
            let ids: Vec<ConsumerIdentity> = (0..consumers)
                .map(|i| ConsumerIdentity::new("host", i as u32, Uuid::new_v4()))
                .collect();
            for id in &ids {
                manager.register_consumer("orders", id).unwrap();
            }

            let mut seen = BTreeSet::new();
            for id in &ids {
                for p in manager.get_consumer_partitions("orders", id, partitions).unwrap() {
                    prop_assert!(seen.insert(p), "partition {} owned twice", p);
                }
            }
            prop_assert_eq!(seen, (0..partitions).collect::<BTreeSet<i32>>());
        }
    }
}
