//! Structured error capture.
//!
//! Reporting never fails and never panics: the consumer process keeps running
//! whatever happens to the report.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

/// Where an error happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorContext {
    pub component: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl ErrorContext {
    pub fn new(component: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            action: action.into(),
            ..Default::default()
        }
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.tags.insert(key.into(), value.to_string());
        self
    }
}

/// One captured error.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub error: String,
    pub context: ErrorContext,
    pub reported_at: DateTime<Utc>,
}

/// Injected error-tracking sink.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &(dyn std::error::Error + 'static), context: ErrorContext);
}

/// Logs every report through `tracing` and keeps the most recent ones in
/// memory for operators and tests.
#[derive(Debug)]
pub struct TracingErrorReporter {
    recent: Mutex<VecDeque<ErrorReport>>,
    capacity: usize,
}

impl TracingErrorReporter {
    pub fn new() -> Self {
        Self::with_capacity(100)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    /// Most recent reports, oldest first.
    pub fn recent(&self) -> Vec<ErrorReport> {
        match self.recent.lock() {
            Ok(recent) => recent.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl Default for TracingErrorReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, err: &(dyn std::error::Error + 'static), context: ErrorContext) {
        let tags = serde_json::to_string(&context.tags).unwrap_or_default();
        error!(
            component = %context.component,
            action = %context.action,
            queue = context.queue.as_deref().unwrap_or(""),
            message_id = context.message_id.as_deref().unwrap_or(""),
            tags = %tags,
            error = %err,
            "queue error reported"
        );

        let report = ErrorReport {
            error: err.to_string(),
            context,
            reported_at: Utc::now(),
        };

        if let Ok(mut recent) = self.recent.lock() {
            if recent.len() == self.capacity {
                recent.pop_front();
            }
            recent.push_back(report);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Boom;

    impl core::fmt::Display for Boom {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            f.write_str("boom")
        }
    }

    impl std::error::Error for Boom {}

    #[test]
    fn reports_keep_context_tags() {
        let reporter = TracingErrorReporter::new();
        reporter.report(
            &Boom,
            ErrorContext::new("connector", "pop")
                .queue("orders")
                .message_id("m-1")
                .tag("partition", 2),
        );

        let recent = reporter.recent();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].error, "boom");
        assert_eq!(recent[0].context.queue.as_deref(), Some("orders"));
        assert_eq!(recent[0].context.tags.get("partition").map(String::as_str), Some("2"));
    }

    #[test]
    fn ring_buffer_drops_oldest() {
        let reporter = TracingErrorReporter::with_capacity(2);
        for action in ["a", "b", "c"] {
            reporter.report(&Boom, ErrorContext::new("pool", action));
        }

        let actions: Vec<_> = reporter.recent().into_iter().map(|r| r.context.action).collect();
        assert_eq!(actions, vec!["b", "c"]);
    }
}
