//! Connector configuration, its validation, and the distributed config
//! providers it can be loaded from.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use jobline_core::{QueueError, QueueResult, TenantId};
use jobline_queue::RetryPolicy;

use crate::broker::{ConsumerSettings, ProducerSettings};
use crate::pool::PoolConfig;

pub mod consul;
pub mod etcd;
pub mod hot_reload;
pub mod provider;
pub mod redis_kv;
pub mod validator;
pub mod znode;

pub use consul::{ConsulConfigBackend, ConsulKv, InMemoryConsulKv};
pub use etcd::{EtcdConfigBackend, EtcdKv, InMemoryEtcdKv};
pub use hot_reload::{ConfigChange, HotReloadHandle, HotReloadManager};
pub use provider::{
    CachedConfigProvider, ConfigBackend, ConfigEntries, ConfigProvider, InMemoryConfigBackend,
};
pub use validator::{ConfigValidator, Rule, ValidationResult, ValueType};
pub use znode::{InMemoryZnodeTree, ZnodeClient, ZookeeperConfigBackend};

#[cfg(feature = "redis")]
pub use redis_kv::RedisConfigBackend;

/// `{prefix}/{tenant}/{seg}/{seg}` for a dot-path key.
pub(crate) fn slash_path(prefix: &str, tenant: &TenantId, key: &str) -> String {
    format!("{prefix}/{tenant}/{}", key.replace('.', "/"))
}

/// Inverse of [`slash_path`]; `None` outside the tenant's namespace.
pub(crate) fn key_from_slash_path(prefix: &str, tenant: &TenantId, path: &str) -> Option<String> {
    let namespace = format!("{prefix}/{tenant}/");
    path.strip_prefix(&namespace)
        .map(|rest| rest.trim_end_matches('/'))
        .filter(|rest| !rest.is_empty())
        .map(|rest| rest.replace('/', "."))
}

/// Problems reading a single configuration field.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: expected {expected}, got {value}")]
    WrongType {
        key: String,
        expected: &'static str,
        value: String,
    },

    #[error("{key}: unknown setting")]
    UnknownKey { key: String },
}

impl From<ConfigError> for QueueError {
    fn from(err: ConfigError) -> Self {
        QueueError::ConfigInvalid(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Snappy => "snappy",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }
}

impl FromStr for Compression {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "snappy" => Ok(Compression::Snappy),
            "lz4" => Ok(Compression::Lz4),
            "zstd" => Ok(Compression::Zstd),
            other => Err(QueueError::config(format!("unknown compression {other:?}"))),
        }
    }
}

/// Everything a connector needs. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Comma-separated bootstrap servers.
    pub brokers: String,
    pub default_queue: String,
    pub group_id: String,
    pub client_id: String,
    pub compression: Compression,
    pub batch_size: u64,
    pub linger_ms: u64,
    pub acks: String,
    /// Enables transactional publish when set.
    pub transactional_id: Option<String>,
    pub transaction_timeout_ms: u64,
    pub flush_timeout_ms: u64,
    pub poll_timeout_ms: u64,
    pub max_attempts: u32,
    pub max_backoff_secs: u64,
    pub rebalance_interval_secs: u64,
    pub consumer_ttl_secs: u64,
    pub idempotency_ttl_secs: u64,
    pub auto_create_topics: bool,
    pub topic_partitions: i32,
    pub replication_factor: i32,
    pub pool: PoolConfig,
    /// Raw consumer client properties (e.g. `session.timeout.ms`).
    pub consumer: BTreeMap<String, String>,
    /// Raw producer client properties.
    pub producer: BTreeMap<String, String>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            default_queue: "default".to_string(),
            group_id: "jobline".to_string(),
            client_id: "jobline".to_string(),
            compression: Compression::None,
            batch_size: 16_384,
            linger_ms: 5,
            acks: "all".to_string(),
            transactional_id: None,
            transaction_timeout_ms: 10_000,
            flush_timeout_ms: 5_000,
            poll_timeout_ms: 1_000,
            max_attempts: 3,
            max_backoff_secs: 3_600,
            rebalance_interval_secs: 30,
            consumer_ttl_secs: 90,
            idempotency_ttl_secs: 86_400,
            auto_create_topics: true,
            topic_partitions: 3,
            replication_factor: 1,
            pool: PoolConfig::default(),
            consumer: BTreeMap::new(),
            producer: BTreeMap::new(),
        }
    }
}

fn wrong_type(key: &str, expected: &'static str, value: &Value) -> ConfigError {
    ConfigError::WrongType {
        key: key.to_string(),
        expected,
        value: value.to_string(),
    }
}

/// Accepts JSON numbers and numeric strings.
fn as_u64(key: &str, value: &Value) -> Result<u64, ConfigError> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| wrong_type(key, "unsigned integer", value))
}

fn as_i32(key: &str, value: &Value) -> Result<i32, ConfigError> {
    let n = as_u64(key, value)?;
    i32::try_from(n).map_err(|_| wrong_type(key, "32-bit integer", value))
}

fn as_u32(key: &str, value: &Value) -> Result<u32, ConfigError> {
    let n = as_u64(key, value)?;
    u32::try_from(n).map_err(|_| wrong_type(key, "32-bit integer", value))
}

fn as_usize(key: &str, value: &Value) -> Result<usize, ConfigError> {
    let n = as_u64(key, value)?;
    usize::try_from(n).map_err(|_| wrong_type(key, "integer", value))
}

fn as_bool(key: &str, value: &Value) -> Result<bool, ConfigError> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
    .ok_or_else(|| wrong_type(key, "boolean", value))
}

/// Strings pass through; scalars are rendered (client properties are text).
fn as_string(key: &str, value: &Value) -> Result<String, ConfigError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(wrong_type(key, "string", value)),
    }
}

impl ConnectorConfig {
    pub fn connection_prefix(connection: &str) -> String {
        format!("kafka.connections.{connection}.")
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_secs(self.rebalance_interval_secs)
    }

    pub fn consumer_ttl(&self) -> Duration {
        Duration::from_secs(self.consumer_ttl_secs)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    /// `2^attempts` seconds, capped at `max_backoff_secs`.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_attempts, Duration::from_secs(self.max_backoff_secs))
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional_id.is_some()
    }

    /// Client properties for producers. Raw `producer` entries win.
    pub fn producer_settings(&self) -> ProducerSettings {
        let mut properties = BTreeMap::from([
            ("bootstrap.servers".to_string(), self.brokers.clone()),
            ("client.id".to_string(), self.client_id.clone()),
            (
                "compression.type".to_string(),
                self.compression.as_str().to_string(),
            ),
            ("batch.size".to_string(), self.batch_size.to_string()),
            ("linger.ms".to_string(), self.linger_ms.to_string()),
            ("acks".to_string(), self.acks.clone()),
        ]);
        properties.extend(self.producer.clone());
        ProducerSettings {
            properties,
            transactional_id: self.transactional_id.clone(),
        }
    }

    /// Client properties for consumers. Offsets are always committed
    /// manually, after the job is acknowledged.
    pub fn consumer_settings(&self) -> ConsumerSettings {
        let mut properties = BTreeMap::from([
            ("bootstrap.servers".to_string(), self.brokers.clone()),
            ("client.id".to_string(), self.client_id.clone()),
            ("auto.offset.reset".to_string(), "earliest".to_string()),
        ]);
        properties.extend(self.consumer.clone());
        properties.insert("enable.auto.commit".to_string(), "false".to_string());
        ConsumerSettings {
            group_id: self.group_id.clone(),
            properties,
        }
    }

    /// Defaults overridden by `JOBLINE_*` environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> QueueResult<Self> {
        let mut config = Self::default();
        if let Some(brokers) = lookup("JOBLINE_KAFKA_BROKERS") {
            config.brokers = brokers;
        }
        if let Some(queue) = lookup("JOBLINE_DEFAULT_QUEUE") {
            config.default_queue = queue;
        }
        if let Some(group) = lookup("JOBLINE_GROUP_ID") {
            config.group_id = group;
        }
        if let Some(id) = lookup("JOBLINE_TRANSACTIONAL_ID").filter(|s| !s.is_empty()) {
            config.transactional_id = Some(id);
        }
        if let Some(max) = lookup("JOBLINE_MAX_ATTEMPTS") {
            config.max_attempts = as_u32("JOBLINE_MAX_ATTEMPTS", &Value::String(max))?;
        }
        Ok(config)
    }

    /// Read the `kafka.connections.<connection>.*` subtree for `tenant`.
    /// Missing keys keep their defaults; unknown keys are rejected.
    pub fn from_provider(
        provider: &dyn crate::config::ConfigProvider,
        tenant: &TenantId,
        connection: &str,
    ) -> QueueResult<Self> {
        let prefix = Self::connection_prefix(connection);
        let mut config = Self::default();
        for (key, value) in provider.get_all(tenant)? {
            if let Some(field) = key.strip_prefix(&prefix) {
                config.apply(field, &value)?;
            }
        }
        Ok(config)
    }

    /// Set one field from its dot-path name relative to the connection.
    pub fn apply(&mut self, field: &str, value: &Value) -> Result<(), ConfigError> {
        if let Some(property) = field.strip_prefix("consumer.") {
            self.consumer.insert(property.to_string(), as_string(field, value)?);
            return Ok(());
        }
        if let Some(property) = field.strip_prefix("producer.") {
            self.producer.insert(property.to_string(), as_string(field, value)?);
            return Ok(());
        }

        match field {
            "brokers" => self.brokers = as_string(field, value)?,
            "default_queue" => self.default_queue = as_string(field, value)?,
            "group_id" => self.group_id = as_string(field, value)?,
            "client_id" => self.client_id = as_string(field, value)?,
            "compression" => {
                self.compression = as_string(field, value)?
                    .parse()
                    .map_err(|_| wrong_type(field, "compression codec", value))?
            }
            "batch_size" => self.batch_size = as_u64(field, value)?,
            "linger_ms" => self.linger_ms = as_u64(field, value)?,
            "acks" => self.acks = as_string(field, value)?,
            "transactional_id" => {
                self.transactional_id = match value {
                    Value::Null => None,
                    _ => Some(as_string(field, value)?).filter(|s| !s.is_empty()),
                }
            }
            "transaction_timeout_ms" => self.transaction_timeout_ms = as_u64(field, value)?,
            "flush_timeout_ms" => self.flush_timeout_ms = as_u64(field, value)?,
            "poll_timeout_ms" => self.poll_timeout_ms = as_u64(field, value)?,
            "max_attempts" => self.max_attempts = as_u32(field, value)?,
            "max_backoff_secs" => self.max_backoff_secs = as_u64(field, value)?,
            "rebalance_interval_secs" => self.rebalance_interval_secs = as_u64(field, value)?,
            "consumer_ttl_secs" => self.consumer_ttl_secs = as_u64(field, value)?,
            "idempotency_ttl_secs" => self.idempotency_ttl_secs = as_u64(field, value)?,
            "auto_create_topics" => self.auto_create_topics = as_bool(field, value)?,
            "topic_partitions" => self.topic_partitions = as_i32(field, value)?,
            "replication_factor" => self.replication_factor = as_i32(field, value)?,
            "pool.min_connections" => self.pool.min_connections = as_usize(field, value)?,
            "pool.max_connections" => self.pool.max_connections = as_usize(field, value)?,
            "pool.max_idle_time_secs" => self.pool.max_idle_time_secs = as_u64(field, value)?,
            "pool.max_wait_time_secs" => self.pool.max_wait_time_secs = as_u64(field, value)?,
            "pool.get_timeout_secs" => self.pool.get_timeout_secs = as_u64(field, value)?,
            "pool.check_interval_secs" => self.pool.check_interval_secs = as_u64(field, value)?,
            _ => {
                return Err(ConfigError::UnknownKey {
                    key: field.to_string(),
                })
            }
        }
        Ok(())
    }

    /// Flatten into `kafka.connections.<connection>.*` entries.
    pub fn to_entries(&self, connection: &str) -> ConfigEntries {
        let p = Self::connection_prefix(connection);
        let mut entries = ConfigEntries::from([
            (format!("{p}brokers"), json!(self.brokers)),
            (format!("{p}default_queue"), json!(self.default_queue)),
            (format!("{p}group_id"), json!(self.group_id)),
            (format!("{p}client_id"), json!(self.client_id)),
            (format!("{p}compression"), json!(self.compression.as_str())),
            (format!("{p}batch_size"), json!(self.batch_size)),
            (format!("{p}linger_ms"), json!(self.linger_ms)),
            (format!("{p}acks"), json!(self.acks)),
            (format!("{p}transaction_timeout_ms"), json!(self.transaction_timeout_ms)),
            (format!("{p}flush_timeout_ms"), json!(self.flush_timeout_ms)),
            (format!("{p}poll_timeout_ms"), json!(self.poll_timeout_ms)),
            (format!("{p}max_attempts"), json!(self.max_attempts)),
            (format!("{p}max_backoff_secs"), json!(self.max_backoff_secs)),
            (format!("{p}rebalance_interval_secs"), json!(self.rebalance_interval_secs)),
            (format!("{p}consumer_ttl_secs"), json!(self.consumer_ttl_secs)),
            (format!("{p}idempotency_ttl_secs"), json!(self.idempotency_ttl_secs)),
            (format!("{p}auto_create_topics"), json!(self.auto_create_topics)),
            (format!("{p}topic_partitions"), json!(self.topic_partitions)),
            (format!("{p}replication_factor"), json!(self.replication_factor)),
            (format!("{p}pool.min_connections"), json!(self.pool.min_connections)),
            (format!("{p}pool.max_connections"), json!(self.pool.max_connections)),
            (format!("{p}pool.max_idle_time_secs"), json!(self.pool.max_idle_time_secs)),
            (format!("{p}pool.max_wait_time_secs"), json!(self.pool.max_wait_time_secs)),
            (format!("{p}pool.get_timeout_secs"), json!(self.pool.get_timeout_secs)),
            (format!("{p}pool.check_interval_secs"), json!(self.pool.check_interval_secs)),
        ]);
        if let Some(id) = &self.transactional_id {
            entries.insert(format!("{p}transactional_id"), json!(id));
        }
        for (k, v) in &self.consumer {
            entries.insert(format!("{p}consumer.{k}"), json!(v));
        }
        for (k, v) in &self.producer {
            entries.insert(format!("{p}producer.{k}"), json!(v));
        }
        entries
    }

    /// Fails with `ConfigInvalid` (fatal) on any rule violation.
    pub fn validate(&self) -> QueueResult<()> {
        ConfigValidator::connector_rules()
            .validate(&self.to_entries("validate"))
            .into_result()?;
        self.pool.validate()
    }
}
