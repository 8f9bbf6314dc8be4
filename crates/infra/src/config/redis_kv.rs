//! Redis layout: one string key per entry, `{prefix}:{tenant}:{seg}:{seg}`,
//! holding the JSON-encoded value.

use jobline_core::TenantId;

pub const DEFAULT_REDIS_PREFIX: &str = "jobline:config";

pub fn redis_key(prefix: &str, tenant: &TenantId, key: &str) -> String {
    format!("{prefix}:{tenant}:{}", key.replace('.', ":"))
}

/// Inverse of [`redis_key`]; `None` for keys outside the tenant's namespace.
pub fn key_from_redis(prefix: &str, tenant: &TenantId, redis_key: &str) -> Option<String> {
    let namespace = format!("{prefix}:{tenant}:");
    redis_key
        .strip_prefix(&namespace)
        .filter(|rest| !rest.is_empty())
        .map(|rest| rest.replace(':', "."))
}

#[cfg(feature = "redis")]
pub use backend::RedisConfigBackend;

#[cfg(feature = "redis")]
mod backend {
    use std::sync::Arc;

    use serde_json::Value;
    use tracing::debug;

    use jobline_core::{QueueError, QueueResult, TenantId};

    use super::{DEFAULT_REDIS_PREFIX, key_from_redis, redis_key};
    use crate::config::provider::{ConfigBackend, ConfigEntries};

    #[derive(Debug, Clone)]
    pub struct RedisConfigBackend {
        client: Arc<redis::Client>,
        prefix: String,
    }

    fn store_err(e: redis::RedisError) -> QueueError {
        QueueError::store(e.to_string())
    }

    impl RedisConfigBackend {
        pub fn new(redis_url: impl AsRef<str>, prefix: Option<String>) -> QueueResult<Self> {
            let client = redis::Client::open(redis_url.as_ref()).map_err(store_err)?;
            Ok(Self {
                client: Arc::new(client),
                prefix: prefix.unwrap_or_else(|| DEFAULT_REDIS_PREFIX.to_string()),
            })
        }

        fn connection(&self) -> QueueResult<redis::Connection> {
            self.client.get_connection().map_err(store_err)
        }

        fn tenant_keys(
            &self,
            conn: &mut redis::Connection,
            tenant: &TenantId,
        ) -> QueueResult<Vec<String>> {
            redis::cmd("KEYS")
                .arg(format!("{}:{}:*", self.prefix, tenant))
                .query::<Vec<String>>(conn)
                .map_err(store_err)
        }
    }

    impl ConfigBackend for RedisConfigBackend {
        fn load(&self, tenant: &TenantId) -> QueueResult<ConfigEntries> {
            let mut conn = self.connection()?;
            let keys = self.tenant_keys(&mut conn, tenant)?;
            if keys.is_empty() {
                return Ok(ConfigEntries::new());
            }

            let raw: Vec<Option<String>> = redis::cmd("MGET")
                .arg(&keys)
                .query(&mut conn)
                .map_err(store_err)?;

            let mut entries = ConfigEntries::new();
            for (redis_key, raw) in keys.iter().zip(raw) {
                let (Some(key), Some(raw)) = (key_from_redis(&self.prefix, tenant, redis_key), raw)
                else {
                    continue;
                };
                entries.insert(key, serde_json::from_str(&raw)?);
            }
            debug!(tenant = %tenant, keys = entries.len(), "config loaded from redis");
            Ok(entries)
        }

        fn store(&self, tenant: &TenantId, key: &str, value: &Value) -> QueueResult<()> {
            let mut conn = self.connection()?;
            redis::cmd("SET")
                .arg(redis_key(&self.prefix, tenant, key))
                .arg(serde_json::to_string(value)?)
                .query::<()>(&mut conn)
                .map_err(store_err)
        }

        fn store_many(&self, tenant: &TenantId, entries: &ConfigEntries) -> QueueResult<()> {
            if entries.is_empty() {
                return Ok(());
            }
            let mut cmd = redis::cmd("MSET");
            for (key, value) in entries {
                cmd.arg(redis_key(&self.prefix, tenant, key))
                    .arg(serde_json::to_string(value)?);
            }
            let mut conn = self.connection()?;
            cmd.query::<()>(&mut conn).map_err(store_err)
        }

        fn remove(&self, tenant: &TenantId, key: &str) -> QueueResult<bool> {
            let mut conn = self.connection()?;
            let removed: i64 = redis::cmd("DEL")
                .arg(redis_key(&self.prefix, tenant, key))
                .query(&mut conn)
                .map_err(store_err)?;
            Ok(removed > 0)
        }

        fn remove_all(&self, tenant: &TenantId) -> QueueResult<()> {
            let mut conn = self.connection()?;
            let keys = self.tenant_keys(&mut conn, tenant)?;
            if keys.is_empty() {
                return Ok(());
            }
            redis::cmd("DEL")
                .arg(&keys)
                .query::<i64>(&mut conn)
                .map_err(store_err)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_paths_become_colon_keys() {
        let t = TenantId::new("acme");
        let k = redis_key(DEFAULT_REDIS_PREFIX, &t, "kafka.connections.kafka.brokers");
        assert_eq!(k, "jobline:config:acme:kafka:connections:kafka:brokers");
        assert_eq!(
            key_from_redis(DEFAULT_REDIS_PREFIX, &t, &k).as_deref(),
            Some("kafka.connections.kafka.brokers")
        );
    }

    #[test]
    fn foreign_keys_are_ignored() {
        let t = TenantId::new("acme");
        assert_eq!(key_from_redis(DEFAULT_REDIS_PREFIX, &t, "jobline:config:other:a"), None);
        assert_eq!(key_from_redis(DEFAULT_REDIS_PREFIX, &t, "jobline:config:acme:"), None);
    }
}
