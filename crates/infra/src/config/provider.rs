//! Tenant-scoped configuration storage with a local refresh cache.
//!
//! A [`ConfigBackend`] is the authoritative store (Redis, Consul, etcd,
//! ZooKeeper or memory). [`CachedConfigProvider`] fronts any backend with a
//! per-tenant snapshot that is reloaded at most once per `refresh_interval`,
//! so a write by any instance is visible everywhere within one interval.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use jobline_core::{Clock, QueueError, QueueResult, TenantId};

pub type ConfigEntries = BTreeMap<String, Value>;

/// Reject empty keys and empty segments (`a..b`, `.a`).
pub fn validate_key(key: &str) -> QueueResult<()> {
    if key.is_empty() || key.split('.').any(str::is_empty) {
        return Err(QueueError::config(format!("invalid config key {key:?}")));
    }
    Ok(())
}

/// Raw authoritative store.
pub trait ConfigBackend: Send + Sync {
    fn load(&self, tenant: &TenantId) -> QueueResult<ConfigEntries>;

    fn store(&self, tenant: &TenantId, key: &str, value: &Value) -> QueueResult<()>;

    fn store_many(&self, tenant: &TenantId, entries: &ConfigEntries) -> QueueResult<()> {
        for (key, value) in entries {
            self.store(tenant, key, value)?;
        }
        Ok(())
    }

    /// Returns whether the key existed.
    fn remove(&self, tenant: &TenantId, key: &str) -> QueueResult<bool>;

    fn remove_all(&self, tenant: &TenantId) -> QueueResult<()>;
}

impl<B: ConfigBackend + ?Sized> ConfigBackend for Arc<B> {
    fn load(&self, tenant: &TenantId) -> QueueResult<ConfigEntries> {
        (**self).load(tenant)
    }

    fn store(&self, tenant: &TenantId, key: &str, value: &Value) -> QueueResult<()> {
        (**self).store(tenant, key, value)
    }

    fn store_many(&self, tenant: &TenantId, entries: &ConfigEntries) -> QueueResult<()> {
        (**self).store_many(tenant, entries)
    }

    fn remove(&self, tenant: &TenantId, key: &str) -> QueueResult<bool> {
        (**self).remove(tenant, key)
    }

    fn remove_all(&self, tenant: &TenantId) -> QueueResult<()> {
        (**self).remove_all(tenant)
    }
}

/// Read/write access to configuration, scoped by tenant.
pub trait ConfigProvider: Send + Sync {
    fn get(&self, tenant: &TenantId, key: &str) -> QueueResult<Option<Value>>;

    fn set(&self, tenant: &TenantId, key: &str, value: Value) -> QueueResult<()>;

    fn set_multiple(&self, tenant: &TenantId, entries: ConfigEntries) -> QueueResult<()>;

    fn delete(&self, tenant: &TenantId, key: &str) -> QueueResult<bool>;

    /// Keys starting with `prefix` (all keys for an empty prefix), sorted.
    fn get_keys(&self, tenant: &TenantId, prefix: &str) -> QueueResult<Vec<String>>;

    fn get_all(&self, tenant: &TenantId) -> QueueResult<ConfigEntries>;

    fn clear(&self, tenant: &TenantId) -> QueueResult<()>;

    /// Reload from the authoritative store now, ignoring the refresh interval.
    fn force_refresh(&self, tenant: &TenantId) -> QueueResult<()>;
}

impl<P: ConfigProvider + ?Sized> ConfigProvider for Arc<P> {
    fn get(&self, tenant: &TenantId, key: &str) -> QueueResult<Option<Value>> {
        (**self).get(tenant, key)
    }

    fn set(&self, tenant: &TenantId, key: &str, value: Value) -> QueueResult<()> {
        (**self).set(tenant, key, value)
    }

    fn set_multiple(&self, tenant: &TenantId, entries: ConfigEntries) -> QueueResult<()> {
        (**self).set_multiple(tenant, entries)
    }

    fn delete(&self, tenant: &TenantId, key: &str) -> QueueResult<bool> {
        (**self).delete(tenant, key)
    }

    fn get_keys(&self, tenant: &TenantId, prefix: &str) -> QueueResult<Vec<String>> {
        (**self).get_keys(tenant, prefix)
    }

    fn get_all(&self, tenant: &TenantId) -> QueueResult<ConfigEntries> {
        (**self).get_all(tenant)
    }

    fn clear(&self, tenant: &TenantId) -> QueueResult<()> {
        (**self).clear(tenant)
    }

    fn force_refresh(&self, tenant: &TenantId) -> QueueResult<()> {
        (**self).force_refresh(tenant)
    }
}

/// In-memory backend for tests/dev. Clones share state, so several providers
/// can stand in for several processes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryConfigBackend {
    tenants: Arc<RwLock<HashMap<String, ConfigEntries>>>,
}

impl InMemoryConfigBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigBackend for InMemoryConfigBackend {
    fn load(&self, tenant: &TenantId) -> QueueResult<ConfigEntries> {
        let tenants = self.tenants.read().unwrap();
        Ok(tenants.get(tenant.as_str()).cloned().unwrap_or_default())
    }

    fn store(&self, tenant: &TenantId, key: &str, value: &Value) -> QueueResult<()> {
        let mut tenants = self.tenants.write().unwrap();
        tenants
            .entry(tenant.to_string())
            .or_default()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    fn remove(&self, tenant: &TenantId, key: &str) -> QueueResult<bool> {
        let mut tenants = self.tenants.write().unwrap();
        Ok(tenants
            .get_mut(tenant.as_str())
            .is_some_and(|entries| entries.remove(key).is_some()))
    }

    fn remove_all(&self, tenant: &TenantId) -> QueueResult<()> {
        self.tenants.write().unwrap().remove(tenant.as_str());
        Ok(())
    }
}

struct Snapshot {
    entries: ConfigEntries,
    loaded_at: DateTime<Utc>,
}

/// Write-through cache over a [`ConfigBackend`].
pub struct CachedConfigProvider<B: ConfigBackend> {
    backend: B,
    clock: Arc<dyn Clock>,
    refresh_interval: Duration,
    cache: RwLock<HashMap<String, Snapshot>>,
}

impl<B: ConfigBackend> CachedConfigProvider<B> {
    pub fn new(backend: B, clock: Arc<dyn Clock>, refresh_interval: Duration) -> Self {
        Self {
            backend,
            clock,
            refresh_interval,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    fn is_fresh(&self, snapshot: &Snapshot) -> bool {
        self.clock
            .now()
            .signed_duration_since(snapshot.loaded_at)
            .to_std()
            .map(|age| age < self.refresh_interval)
            .unwrap_or(true)
    }

    fn reload(&self, tenant: &TenantId) -> QueueResult<ConfigEntries> {
        let entries = self.backend.load(tenant)?;
        debug!(tenant = %tenant, keys = entries.len(), "config snapshot reloaded");
        self.cache.write().unwrap().insert(
            tenant.to_string(),
            Snapshot {
                entries: entries.clone(),
                loaded_at: self.clock.now(),
            },
        );
        Ok(entries)
    }

    fn snapshot(&self, tenant: &TenantId) -> QueueResult<ConfigEntries> {
        {
            let cache = self.cache.read().unwrap();
            if let Some(snapshot) = cache.get(tenant.as_str()) {
                if self.is_fresh(snapshot) {
                    return Ok(snapshot.entries.clone());
                }
            }
        }
        self.reload(tenant)
    }

    /// Apply a local write to the cached snapshot without touching its age.
    fn update_cached(&self, tenant: &TenantId, apply: impl FnOnce(&mut ConfigEntries)) {
        let mut cache = self.cache.write().unwrap();
        if let Some(snapshot) = cache.get_mut(tenant.as_str()) {
            apply(&mut snapshot.entries);
        }
    }
}

impl<B: ConfigBackend> ConfigProvider for CachedConfigProvider<B> {
    fn get(&self, tenant: &TenantId, key: &str) -> QueueResult<Option<Value>> {
        Ok(self.snapshot(tenant)?.remove(key))
    }

    fn set(&self, tenant: &TenantId, key: &str, value: Value) -> QueueResult<()> {
        validate_key(key)?;
        self.backend.store(tenant, key, &value)?;
        self.update_cached(tenant, |entries| {
            entries.insert(key.to_string(), value);
        });
        Ok(())
    }

    fn set_multiple(&self, tenant: &TenantId, entries: ConfigEntries) -> QueueResult<()> {
        for key in entries.keys() {
            validate_key(key)?;
        }
        self.backend.store_many(tenant, &entries)?;
        self.update_cached(tenant, |cached| cached.extend(entries));
        Ok(())
    }

    fn delete(&self, tenant: &TenantId, key: &str) -> QueueResult<bool> {
        let existed = self.backend.remove(tenant, key)?;
        self.update_cached(tenant, |entries| {
            entries.remove(key);
        });
        Ok(existed)
    }

    fn get_keys(&self, tenant: &TenantId, prefix: &str) -> QueueResult<Vec<String>> {
        Ok(self
            .snapshot(tenant)?
            .into_keys()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    fn get_all(&self, tenant: &TenantId) -> QueueResult<ConfigEntries> {
        self.snapshot(tenant)
    }

    fn clear(&self, tenant: &TenantId) -> QueueResult<()> {
        self.backend.remove_all(tenant)?;
        self.update_cached(tenant, ConfigEntries::clear);
        Ok(())
    }

    fn force_refresh(&self, tenant: &TenantId) -> QueueResult<()> {
        self.reload(tenant).map(|_| ())
    }
}

impl<B: ConfigBackend> core::fmt::Debug for CachedConfigProvider<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CachedConfigProvider")
            .field("refresh_interval", &self.refresh_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobline_core::ManualClock;
    use serde_json::json;

    fn provider(
        backend: InMemoryConfigBackend,
        clock: Arc<ManualClock>,
    ) -> CachedConfigProvider<InMemoryConfigBackend> {
        CachedConfigProvider::new(backend, clock, Duration::from_secs(10))
    }

    #[test]
    fn set_then_get_is_immediate_for_the_writer() {
        let clock = Arc::new(ManualClock::starting_now());
        let p = provider(InMemoryConfigBackend::new(), clock);
        let t = TenantId::new("acme");

        p.set(&t, "kafka.connections.kafka.brokers", json!("b1:9092")).unwrap();
        assert_eq!(
            p.get(&t, "kafka.connections.kafka.brokers").unwrap(),
            Some(json!("b1:9092"))
        );
        assert_eq!(
            p.get(&TenantId::new("other"), "kafka.connections.kafka.brokers")
                .unwrap(),
            None
        );
    }

    #[test]
    fn other_readers_converge_within_one_refresh_interval() {
        let clock = Arc::new(ManualClock::starting_now());
        let backend = InMemoryConfigBackend::new();
        let writer = provider(backend.clone(), clock.clone());
        let reader = provider(backend, clock.clone());
        let t = TenantId::new("acme");

        writer.set(&t, "a.b", json!(1)).unwrap();
        assert_eq!(reader.get(&t, "a.b").unwrap(), Some(json!(1)));

        writer.set(&t, "a.b", json!(2)).unwrap();
        assert_eq!(reader.get(&t, "a.b").unwrap(), Some(json!(1)));

        clock.advance(Duration::from_secs(10));
        assert_eq!(reader.get(&t, "a.b").unwrap(), Some(json!(2)));
    }

    #[test]
    fn force_refresh_bypasses_interval() {
        let clock = Arc::new(ManualClock::starting_now());
        let backend = InMemoryConfigBackend::new();
        let writer = provider(backend.clone(), clock.clone());
        let reader = provider(backend, clock);
        let t = TenantId::new("acme");

        assert_eq!(reader.get(&t, "x.y").unwrap(), None);
        writer.set(&t, "x.y", json!(true)).unwrap();
        reader.force_refresh(&t).unwrap();
        assert_eq!(reader.get(&t, "x.y").unwrap(), Some(json!(true)));
    }

    #[test]
    fn keys_delete_and_clear() {
        let clock = Arc::new(ManualClock::starting_now());
        let p = provider(InMemoryConfigBackend::new(), clock);
        let t = TenantId::new("acme");

        let mut entries = ConfigEntries::new();
        entries.insert("kafka.a".into(), json!(1));
        entries.insert("kafka.b".into(), json!(2));
        entries.insert("redis.url".into(), json!("redis://"));
        p.set_multiple(&t, entries).unwrap();

        assert_eq!(p.get_keys(&t, "kafka.").unwrap(), vec!["kafka.a", "kafka.b"]);
        assert!(p.delete(&t, "kafka.a").unwrap());
        assert!(!p.delete(&t, "kafka.a").unwrap());
        assert_eq!(p.get_all(&t).unwrap().len(), 2);

        p.clear(&t).unwrap();
        assert!(p.get_all(&t).unwrap().is_empty());
    }

    #[test]
    fn malformed_keys_are_rejected() {
        let clock = Arc::new(ManualClock::starting_now());
        let p = provider(InMemoryConfigBackend::new(), clock);
        let t = TenantId::new("acme");
        assert!(matches!(p.set(&t, "a..b", json!(1)), Err(QueueError::ConfigInvalid(_))));
        assert!(p.set(&t, "", json!(1)).is_err());
    }
}
