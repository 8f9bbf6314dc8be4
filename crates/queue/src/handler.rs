//! Job handlers and routing by job name.

use std::collections::HashMap;
use std::time::Duration;

use jobline_core::{JobData, MessageId};

/// Borrowed view of a delivered job.
#[derive(Debug, Clone, Copy)]
pub struct JobContext<'a> {
    pub id: &'a MessageId,
    pub name: &'a str,
    pub data: &'a JobData,
    pub attempts: u32,
    pub queue: &'a str,
}

/// Result of running a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// Done; acknowledge the message.
    Success,
    /// Failed; retried with backoff until the retry budget runs out.
    Failure(String),
    /// Transient failure; redeliver without delay.
    RetryNow,
    /// Redeliver after an explicit delay.
    RetryAfter(Duration),
    /// Not worth retrying; dead-letter immediately.
    Fatal(String),
}

/// Job handler function type.
pub type JobHandler = Box<dyn Fn(&JobContext<'_>) -> JobResult + Send + Sync>;

/// Handlers keyed by job name.
///
/// Lookup order: exact name, then `"prefix.*"` patterns, then `"*"`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, JobHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(&JobContext<'_>) -> JobResult + Send + Sync + 'static,
    {
        self.handlers.insert(pattern.into(), Box::new(handler));
    }

    pub fn get(&self, job_name: &str) -> Option<&JobHandler> {
        if let Some(h) = self.handlers.get(job_name) {
            return Some(h);
        }

        // Longest matching prefix wins ("billing.invoice.*" over "billing.*").
        let mut best: Option<(&str, &JobHandler)> = None;
        for (pattern, handler) in &self.handlers {
            if let Some(prefix) = pattern.strip_suffix(".*") {
                let matches = job_name
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('.'));
                if matches && best.map_or(true, |(p, _)| prefix.len() > p.len()) {
                    best = Some((prefix, handler));
                }
            }
        }
        if let Some((_, handler)) = best {
            return Some(handler);
        }

        self.handlers.get("*")
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut patterns: Vec<_> = self.handlers.keys().collect();
        patterns.sort();
        f.debug_struct("HandlerRegistry")
            .field("patterns", &patterns)
            .finish()
    }
}
