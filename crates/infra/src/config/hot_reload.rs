//! Periodic configuration reload with change notification.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use jobline_core::{QueueResult, TenantId};
use jobline_queue::ShutdownToken;

use super::provider::{ConfigEntries, ConfigProvider};

/// One key that was added, changed or removed between two reloads.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigChange {
    pub tenant: TenantId,
    pub key: String,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

pub type ConfigListener = Box<dyn Fn(&ConfigChange) + Send + Sync>;

/// Key-level differences between two snapshots, ordered by key.
pub fn diff_snapshots(
    tenant: &TenantId,
    old: &ConfigEntries,
    new: &ConfigEntries,
) -> Vec<ConfigChange> {
    let mut changes = Vec::new();
    for (key, value) in new {
        if old.get(key) != Some(value) {
            changes.push(ConfigChange {
                tenant: tenant.clone(),
                key: key.clone(),
                old: old.get(key).cloned(),
                new: Some(value.clone()),
            });
        }
    }
    for (key, value) in old {
        if !new.contains_key(key) {
            changes.push(ConfigChange {
                tenant: tenant.clone(),
                key: key.clone(),
                old: Some(value.clone()),
                new: None,
            });
        }
    }
    changes.sort_by(|a, b| a.key.cmp(&b.key));
    changes
}

pub struct HotReloadManager {
    provider: Arc<dyn ConfigProvider>,
    tenants: Vec<TenantId>,
    interval: Duration,
    snapshots: Mutex<HashMap<String, ConfigEntries>>,
    listeners: RwLock<Vec<ConfigListener>>,
}

impl HotReloadManager {
    pub fn new(
        provider: Arc<dyn ConfigProvider>,
        tenants: Vec<TenantId>,
        interval: Duration,
    ) -> Self {
        Self {
            provider,
            tenants,
            interval,
            snapshots: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn on_change(&self, listener: impl Fn(&ConfigChange) + Send + Sync + 'static) {
        self.listeners.write().unwrap().push(Box::new(listener));
    }

    /// Record the current configuration as the baseline without notifying.
    pub fn prime(&self) -> QueueResult<()> {
        let mut snapshots = self.snapshots.lock().unwrap();
        for tenant in &self.tenants {
            self.provider.force_refresh(tenant)?;
            snapshots.insert(tenant.to_string(), self.provider.get_all(tenant)?);
        }
        Ok(())
    }

    /// Reload every tenant now and notify listeners of each change. A tenant
    /// without a baseline reports all of its keys as added.
    pub fn reload_now(&self) -> QueueResult<Vec<ConfigChange>> {
        let mut all_changes = Vec::new();
        for tenant in &self.tenants {
            self.provider.force_refresh(tenant)?;
            let current = self.provider.get_all(tenant)?;
            let previous = self
                .snapshots
                .lock()
                .unwrap()
                .insert(tenant.to_string(), current.clone())
                .unwrap_or_default();
            all_changes.extend(diff_snapshots(tenant, &previous, &current));
        }

        if !all_changes.is_empty() {
            info!(changes = all_changes.len(), "configuration reloaded");
            let listeners = self.listeners.read().unwrap();
            for change in &all_changes {
                for listener in listeners.iter() {
                    listener(change);
                }
            }
        }
        Ok(all_changes)
    }

    /// Reload every `interval` on a background thread until the handle is
    /// shut down. Reload failures are logged and retried next tick.
    pub fn spawn(self: Arc<Self>) -> HotReloadHandle {
        let token = ShutdownToken::new();
        let thread_token = token.clone();
        let join = thread::Builder::new()
            .name("jobline-config-reload".to_string())
            .spawn(move || {
                info!(interval_secs = self.interval.as_secs(), "config hot reload started");
                while !thread_token.wait_for(self.interval) {
                    if let Err(e) = self.reload_now() {
                        warn!(error = %e, "config reload failed");
                    }
                }
                info!("config hot reload stopped");
            })
            .expect("failed to spawn config reload thread");
        HotReloadHandle {
            token,
            join: Some(join),
        }
    }
}

impl core::fmt::Debug for HotReloadManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HotReloadManager")
            .field("tenants", &self.tenants)
            .field("interval", &self.interval)
            .finish()
    }
}

pub struct HotReloadHandle {
    token: ShutdownToken,
    join: Option<JoinHandle<()>>,
}

impl HotReloadHandle {
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.token.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for HotReloadHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::provider::{CachedConfigProvider, InMemoryConfigBackend};
    use jobline_core::SystemClock;
    use serde_json::json;

    fn setup() -> (Arc<dyn ConfigProvider>, TenantId) {
        let provider = CachedConfigProvider::new(
            InMemoryConfigBackend::new(),
            Arc::new(SystemClock),
            Duration::from_secs(60),
        );
        (Arc::new(provider), TenantId::new("acme"))
    }

    #[test]
    fn diff_reports_added_changed_and_removed() {
        let t = TenantId::new("t");
        let old = ConfigEntries::from([("a".to_string(), json!(1)), ("b".to_string(), json!(2))]);
        let new = ConfigEntries::from([
            ("a".to_string(), json!(1)),
            ("b".to_string(), json!(3)),
            ("c".to_string(), json!(4)),
        ]);

        let changes = diff_snapshots(&t, &old, &new);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].key, "b");
        assert_eq!(changes[0].old, Some(json!(2)));
        assert_eq!(changes[1].key, "c");
        assert_eq!(changes[1].old, None);

        let removed = diff_snapshots(&t, &new, &old);
        assert!(removed.iter().any(|c| c.key == "c" && c.new.is_none()));
    }

    #[test]
    fn reload_notifies_listeners_once_per_change() {
        let (provider, t) = setup();
        provider.set(&t, "kafka.brokers", json!("a:9092")).unwrap();

        let manager =
            HotReloadManager::new(provider.clone(), vec![t.clone()], Duration::from_secs(1));
        manager.prime().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager.on_change(move |c| sink.lock().unwrap().push(c.key.clone()));

        assert!(manager.reload_now().unwrap().is_empty());

        provider.set(&t, "kafka.brokers", json!("b:9092")).unwrap();
        let changes = manager.reload_now().unwrap();
        assert_eq!(changes[0].new, Some(json!("b:9092")));
        assert_eq!(*seen.lock().unwrap(), vec!["kafka.brokers"]);

        assert!(manager.reload_now().unwrap().is_empty());
    }

    #[test]
    fn background_reload_stops_on_shutdown() {
        let (provider, t) = setup();
        let manager = Arc::new(HotReloadManager::new(
            provider.clone(),
            vec![t.clone()],
            Duration::from_millis(10),
        ));
        manager.prime().unwrap();

        let seen = Arc::new(Mutex::new(0usize));
        let sink = seen.clone();
        manager.on_change(move |_| *sink.lock().unwrap() += 1);

        let handle = manager.clone().spawn();
        provider.set(&t, "x", json!(1)).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while *seen.lock().unwrap() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        handle.shutdown();
        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
