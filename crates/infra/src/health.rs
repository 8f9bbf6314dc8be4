//! Per-consumer health records.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use jobline_core::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Active,
    Consuming,
    Processing,
    Rebalancing,
    Error,
    ShuttingDown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Active => "active",
            HealthStatus::Consuming => "consuming",
            HealthStatus::Processing => "processing",
            HealthStatus::Rebalancing => "rebalancing",
            HealthStatus::Error => "error",
            HealthStatus::ShuttingDown => "shutting_down",
        }
    }
}

impl core::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub consumer_id: String,
    pub status: HealthStatus,
    pub metadata: BTreeMap<String, Value>,
    pub last_heartbeat: i64,
}

/// Records are only removed by [`HealthRegistry::unregister`].
#[derive(Debug)]
pub struct HealthRegistry {
    records: RwLock<HashMap<String, HealthRecord>>,
    clock: Arc<dyn Clock>,
}

impl HealthRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Set `status` and merge `metadata` into the consumer's record.
    pub fn update(
        &self,
        consumer_id: &str,
        status: HealthStatus,
        metadata: impl IntoIterator<Item = (String, Value)>,
    ) {
        let now = self.clock.unix_now();
        let mut records = self.records.write().unwrap();
        let record = records
            .entry(consumer_id.to_string())
            .or_insert_with(|| HealthRecord {
                consumer_id: consumer_id.to_string(),
                status,
                metadata: BTreeMap::new(),
                last_heartbeat: now,
            });

        if record.status != status {
            debug!(
                consumer = consumer_id,
                from = %record.status,
                to = %status,
                "health transition"
            );
        }
        record.status = status;
        record.metadata.extend(metadata);
        record.last_heartbeat = now;
    }

    pub fn set_status(&self, consumer_id: &str, status: HealthStatus) {
        self.update(consumer_id, status, std::iter::empty());
    }

    /// Refresh the heartbeat without changing status. Unknown consumers are
    /// registered as `active`.
    pub fn heartbeat(&self, consumer_id: &str) {
        let now = self.clock.unix_now();
        let mut records = self.records.write().unwrap();
        records
            .entry(consumer_id.to_string())
            .and_modify(|r| r.last_heartbeat = now)
            .or_insert_with(|| HealthRecord {
                consumer_id: consumer_id.to_string(),
                status: HealthStatus::Active,
                metadata: BTreeMap::new(),
                last_heartbeat: now,
            });
    }

    pub fn get(&self, consumer_id: &str) -> Option<HealthRecord> {
        self.records.read().unwrap().get(consumer_id).cloned()
    }

    pub fn status(&self, consumer_id: &str) -> Option<HealthStatus> {
        self.records
            .read()
            .unwrap()
            .get(consumer_id)
            .map(|r| r.status)
    }

    /// Every record, sorted by consumer id.
    pub fn all(&self) -> Vec<HealthRecord> {
        let mut all: Vec<_> = self.records.read().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.consumer_id.cmp(&b.consumer_id));
        all
    }

    /// Records whose last heartbeat is older than `max_age`.
    pub fn stale(&self, max_age: Duration) -> Vec<HealthRecord> {
        let age = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
        let cutoff = self.clock.unix_now().saturating_sub(age);
        self.all()
            .into_iter()
            .filter(|r| r.last_heartbeat < cutoff)
            .collect()
    }

    pub fn unregister(&self, consumer_id: &str) -> bool {
        self.records.write().unwrap().remove(consumer_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobline_core::ManualClock;
    use serde_json::json;

    #[test]
    fn update_merges_metadata_and_tracks_heartbeat() {
        let clock = Arc::new(ManualClock::starting_now());
        let health = HealthRegistry::new(clock.clone());

        health.update("c1", HealthStatus::Consuming, [("queue".to_string(), json!("mail"))]);
        clock.advance(Duration::from_secs(5));
        health.update("c1", HealthStatus::Processing, [("partitions".to_string(), json!([0, 2]))]);

        let record = health.get("c1").unwrap();
        assert_eq!(record.status, HealthStatus::Processing);
        assert_eq!(record.metadata["queue"], json!("mail"));
        assert_eq!(record.metadata["partitions"], json!([0, 2]));
        assert_eq!(record.last_heartbeat, clock.unix_now());
    }

    #[test]
    fn stale_records_are_reported_until_unregistered() {
        let clock = Arc::new(ManualClock::starting_now());
        let health = HealthRegistry::new(clock.clone());
        health.heartbeat("old");
        clock.advance(Duration::from_secs(120));
        health.heartbeat("fresh");

        let stale: Vec<_> = health
            .stale(Duration::from_secs(60))
            .into_iter()
            .map(|r| r.consumer_id)
            .collect();
        assert_eq!(stale, vec!["old"]);

        assert!(health.unregister("old"));
        assert!(health.stale(Duration::from_secs(60)).is_empty());
        assert_eq!(health.status("fresh"), Some(HealthStatus::Active));
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(HealthStatus::ShuttingDown).unwrap(),
            json!("shutting_down")
        );
    }
}
