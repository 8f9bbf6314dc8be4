//! Generic push/pop queue abstraction consumed by business jobs.
//!
//! Business code only sees a job name, a JSON data map, and three ways to
//! finish a delivery: `delete`, `release(delay)` and `fail(error)`.

pub mod handler;
pub mod queue;
pub mod retry;
pub mod shutdown;
pub mod worker;

pub use handler::{HandlerRegistry, JobContext, JobHandler, JobResult};
pub use queue::{JobHandle, Queue, ReleaseOutcome};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use shutdown::ShutdownToken;
pub use worker::{Processed, QueueWorker, WorkerConfig, WorkerHandle, WorkerStats};
