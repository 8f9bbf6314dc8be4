//! Consume loop that dispatches jobs to registered handlers.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use jobline_core::QueueResult;

use crate::handler::{HandlerRegistry, JobResult};
use crate::queue::{JobHandle, Queue, ReleaseOutcome};
use crate::retry::RetryPolicy;
use crate::shutdown::ShutdownToken;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging and the thread name
    pub name: String,
    /// Queue to consume; `None` is the connector default
    pub queue: Option<String>,
    /// Pause after a pop that delivered nothing
    pub idle_sleep: Duration,
    /// Pause after a pop error
    pub error_backoff: Duration,
    /// Backoff and retry budget for `JobResult::Failure` when the queue
    /// has none of its own
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "queue-worker".to_string(),
            queue: None,
            idle_sleep: Duration::from_millis(10),
            error_backoff: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_released: u64,
    pub jobs_dead_lettered: u64,
    pub pop_errors: u64,
    pub uptime_secs: u64,
}

/// What happened to one delivered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    Deleted,
    Released(ReleaseOutcome),
    Failed,
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    token: ShutdownToken,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the in-flight job to finish.
    pub fn shutdown(mut self) {
        self.token.cancel();
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn token(&self) -> &ShutdownToken {
        &self.token
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap().clone()
    }
}

/// Pops jobs from a [`Queue`] and acknowledges them according to the
/// handler's [`JobResult`].
pub struct QueueWorker<Q: Queue> {
    queue: Arc<Q>,
    handlers: HandlerRegistry,
    config: WorkerConfig,
}

impl<Q: Queue + 'static> QueueWorker<Q> {
    pub fn new(queue: Arc<Q>, handlers: HandlerRegistry, config: WorkerConfig) -> Self {
        Self {
            queue,
            handlers,
            config,
        }
    }

    /// Pop at most one job and run it to acknowledgement.
    ///
    /// `Ok(None)` means nothing was delivered.
    pub fn process_one(&self) -> QueueResult<Option<Processed>> {
        let Some(job) = self.queue.pop(self.config.queue.as_deref())? else {
            return Ok(None);
        };

        let result = match self.handlers.get(job.name()) {
            Some(handler) => handler(&job.context()),
            None => {
                warn!(
                    worker = %self.config.name,
                    job = job.name(),
                    message_id = %job.id(),
                    "no handler for job"
                );
                JobResult::Failure(format!("no handler for job: {}", job.name()))
            }
        };

        debug!(
            worker = %self.config.name,
            message_id = %job.id(),
            attempts = job.attempts(),
            result = ?result,
            "job handled"
        );

        let processed = match result {
            JobResult::Success => {
                job.delete()?;
                Processed::Deleted
            }
            JobResult::Failure(error) => {
                let policy = self.queue.retry_policy().unwrap_or(&self.config.retry);
                let next = job.attempts() + 1;
                if policy.should_retry(next) {
                    let delay = policy.delay_for_attempt(next);
                    Processed::Released(job.release(delay)?)
                } else {
                    job.fail(&error)?;
                    Processed::Failed
                }
            }
            JobResult::RetryNow => Processed::Released(job.release(Duration::ZERO)?),
            JobResult::RetryAfter(delay) => Processed::Released(job.release(delay)?),
            JobResult::Fatal(error) => {
                job.fail(&error)?;
                Processed::Failed
            }
        };

        Ok(Some(processed))
    }

    /// Spawn the worker loop on its own thread.
    pub fn spawn(self) -> WorkerHandle
    where
        Q: Send + Sync,
    {
        let token = ShutdownToken::new();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let loop_token = token.clone();
        let loop_stats = stats.clone();
        let join = thread::Builder::new()
            .name(self.config.name.clone())
            .spawn(move || worker_loop(self, loop_token, loop_stats))
            .expect("failed to spawn queue worker thread");

        WorkerHandle {
            token,
            join: Some(join),
            stats,
        }
    }
}

fn worker_loop<Q: Queue + 'static>(
    worker: QueueWorker<Q>,
    token: ShutdownToken,
    stats: Arc<Mutex<WorkerStats>>,
) {
    info!(worker = %worker.config.name, "queue worker started");
    let start_time = Instant::now();

    while !token.is_cancelled() && !worker.queue.is_shutting_down() {
        let outcome = worker.process_one();

        {
            let mut s = stats.lock().unwrap();
            s.uptime_secs = start_time.elapsed().as_secs();
            match &outcome {
                Ok(Some(processed)) => {
                    s.jobs_processed += 1;
                    match processed {
                        Processed::Deleted => s.jobs_succeeded += 1,
                        Processed::Released(ReleaseOutcome::Requeued { .. }) => {
                            s.jobs_released += 1
                        }
                        Processed::Released(ReleaseOutcome::DeadLettered { .. })
                        | Processed::Failed => s.jobs_dead_lettered += 1,
                    }
                }
                Ok(None) => {}
                Err(_) => s.pop_errors += 1,
            }
        }

        match outcome {
            Ok(Some(_)) => {}
            Ok(None) => {
                token.wait_for(worker.config.idle_sleep);
            }
            Err(e) => {
                error!(worker = %worker.config.name, error = %e, "queue worker iteration failed");
                token.wait_for(worker.config.error_backoff);
            }
        }
    }

    info!(worker = %worker.config.name, "queue worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    use jobline_core::{JobData, MessageId};
    use serde_json::Value;

    #[derive(Debug, Clone, PartialEq)]
    enum Ack {
        Deleted(String),
        Released(String, u32, Duration),
        Failed(String, String),
    }

    #[derive(Default)]
    struct FakeQueue {
        pending: Mutex<VecDeque<(MessageId, String, u32)>>,
        acks: Mutex<Vec<Ack>>,
        shutting_down: AtomicBool,
        max_attempts: u32,
        policy: Option<RetryPolicy>,
    }

    impl FakeQueue {
        fn with_job(name: &str, attempts: u32) -> Arc<Self> {
            let queue = Arc::new(Self {
                max_attempts: 3,
                ..Default::default()
            });
            queue
                .pending
                .lock()
                .unwrap()
                .push_back((MessageId::new(), name.to_string(), attempts));
            queue
        }

        fn acks(&self) -> Vec<Ack> {
            self.acks.lock().unwrap().clone()
        }
    }

    struct FakeJob<'a> {
        queue: &'a FakeQueue,
        id: MessageId,
        name: String,
        data: JobData,
        attempts: u32,
    }

    impl JobHandle for FakeJob<'_> {
        fn id(&self) -> &MessageId {
            &self.id
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn data(&self) -> &JobData {
            &self.data
        }

        fn attempts(&self) -> u32 {
            self.attempts
        }

        fn queue(&self) -> &str {
            "default"
        }

        fn delete(self) -> QueueResult<()> {
            self.queue
                .acks
                .lock()
                .unwrap()
                .push(Ack::Deleted(self.name.clone()));
            Ok(())
        }

        fn release(self, delay: Duration) -> QueueResult<ReleaseOutcome> {
            let attempts = self.attempts + 1;
            self.queue
                .acks
                .lock()
                .unwrap()
                .push(Ack::Released(self.name.clone(), attempts, delay));
            if attempts > self.queue.max_attempts {
                return Ok(ReleaseOutcome::DeadLettered { attempts });
            }
            Ok(ReleaseOutcome::Requeued { attempts, delay })
        }

        fn fail(self, error: &str) -> QueueResult<()> {
            self.queue
                .acks
                .lock()
                .unwrap()
                .push(Ack::Failed(self.name.clone(), error.to_string()));
            Ok(())
        }
    }

    impl Queue for FakeQueue {
        type Job<'a> = FakeJob<'a>;

        fn push(&self, job: &str, _data: Value, _queue: Option<&str>) -> QueueResult<MessageId> {
            let id = MessageId::new();
            self.pending
                .lock()
                .unwrap()
                .push_back((id.clone(), job.to_string(), 0));
            Ok(id)
        }

        fn push_raw(&self, _payload: &[u8], _queue: Option<&str>) -> QueueResult<()> {
            Ok(())
        }

        fn later(
            &self,
            _delay: Duration,
            job: &str,
            data: Value,
            queue: Option<&str>,
        ) -> QueueResult<MessageId> {
            self.push(job, data, queue)
        }

        fn pop(&self, _queue: Option<&str>) -> QueueResult<Option<FakeJob<'_>>> {
            if self.is_shutting_down() {
                return Ok(None);
            }
            let next = self.pending.lock().unwrap().pop_front();
            Ok(next.map(|(id, name, attempts)| FakeJob {
                queue: self,
                id,
                name,
                data: JobData::new(),
                attempts,
            }))
        }

        fn retry_policy(&self) -> Option<&RetryPolicy> {
            self.policy.as_ref()
        }

        fn shutdown(&self) {
            self.shutting_down.store(true, Ordering::SeqCst);
        }

        fn is_shutting_down(&self) -> bool {
            self.shutting_down.load(Ordering::SeqCst)
        }
    }

    fn worker(queue: Arc<FakeQueue>) -> QueueWorker<FakeQueue> {
        let mut handlers = HandlerRegistry::new();
        handlers.register("ok", |_| JobResult::Success);
        handlers.register("flaky", |_| JobResult::Failure("db timeout".into()));
        handlers.register("now", |_| JobResult::RetryNow);
        handlers.register("later", |_| JobResult::RetryAfter(Duration::from_secs(30)));
        handlers.register("broken", |_| JobResult::Fatal("bad payload".into()));
        QueueWorker::new(queue, handlers, WorkerConfig::default())
    }

    #[test]
    fn success_deletes_job() {
        let queue = FakeQueue::with_job("ok", 0);
        let outcome = worker(queue.clone()).process_one().unwrap();

        assert_eq!(outcome, Some(Processed::Deleted));
        assert_eq!(queue.acks(), vec![Ack::Deleted("ok".into())]);
    }

    #[test]
    fn failure_releases_with_exponential_backoff() {
        let queue = FakeQueue::with_job("flaky", 1);
        worker(queue.clone()).process_one().unwrap();

        assert_eq!(
            queue.acks(),
            vec![Ack::Released("flaky".into(), 2, Duration::from_secs(4))]
        );
    }

    #[test]
    fn failure_past_retry_budget_fails_job() {
        let queue = FakeQueue::with_job("flaky", 3);
        let outcome = worker(queue.clone()).process_one().unwrap();

        assert_eq!(outcome, Some(Processed::Failed));
        assert_eq!(
            queue.acks(),
            vec![Ack::Failed("flaky".into(), "db timeout".into())]
        );
    }

    #[test]
    fn queue_retry_budget_overrides_worker_default() {
        let queue = Arc::new(FakeQueue {
            max_attempts: 5,
            policy: Some(RetryPolicy::exponential(5, Duration::from_secs(3600))),
            ..Default::default()
        });
        queue.push("flaky", Value::Null, None).unwrap();
        queue.pending.lock().unwrap()[0].2 = 3;

        let outcome = worker(queue.clone()).process_one().unwrap();

        assert_eq!(
            outcome,
            Some(Processed::Released(ReleaseOutcome::Requeued {
                attempts: 4,
                delay: Duration::from_secs(16),
            }))
        );
        assert_eq!(
            queue.acks(),
            vec![Ack::Released("flaky".into(), 4, Duration::from_secs(16))]
        );
    }

    #[test]
    fn retry_results_map_to_release_delays() {
        let queue = FakeQueue::with_job("now", 0);
        queue.push("later", Value::Null, None).unwrap();
        let worker = worker(queue.clone());
        worker.process_one().unwrap();
        worker.process_one().unwrap();

        assert_eq!(
            queue.acks(),
            vec![
                Ack::Released("now".into(), 1, Duration::ZERO),
                Ack::Released("later".into(), 1, Duration::from_secs(30)),
            ]
        );
    }

    #[test]
    fn fatal_and_missing_handler() {
        let queue = FakeQueue::with_job("broken", 0);
        queue.push("unknown", Value::Null, None).unwrap();
        let worker = worker(queue.clone());

        assert_eq!(worker.process_one().unwrap(), Some(Processed::Failed));
        let missing = worker.process_one().unwrap();

        assert!(matches!(
            missing,
            Some(Processed::Released(ReleaseOutcome::Requeued { attempts: 1, .. }))
        ));
        assert_eq!(queue.acks()[0], Ack::Failed("broken".into(), "bad payload".into()));
    }

    #[test]
    fn empty_queue_yields_none() {
        let queue = Arc::new(FakeQueue::default());
        assert_eq!(worker(queue).process_one().unwrap(), None);
    }

    #[test]
    fn spawned_worker_drains_and_stops() {
        let queue = FakeQueue::with_job("ok", 0);
        queue.push("ok", Value::Null, None).unwrap();

        let handle = worker(queue.clone()).spawn();
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().jobs_succeeded < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let stats = handle.stats();
        handle.shutdown();

        assert_eq!(stats.jobs_succeeded, 2);
        assert_eq!(queue.acks().len(), 2);
    }
}
