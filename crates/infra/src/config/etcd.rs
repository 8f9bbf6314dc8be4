//! etcd v3 layout: `{prefix}/{tenant}/{seg}/{seg}` holding the JSON-encoded
//! value. The v3 JSON gateway base64-encodes both keys and values.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};

use jobline_core::{QueueError, QueueResult, TenantId};

use super::provider::{ConfigBackend, ConfigEntries};
use super::{key_from_slash_path, slash_path};

pub const DEFAULT_ETCD_PREFIX: &str = "/jobline/config";

/// Minimal etcd KV surface over decoded keys and values.
pub trait EtcdKv: Send + Sync {
    /// Every pair whose key starts with `prefix`.
    fn range(&self, prefix: &str) -> QueueResult<Vec<(String, Vec<u8>)>>;

    fn put(&self, key: &str, value: &[u8]) -> QueueResult<()>;

    /// Delete `key`, or every key starting with it when `prefix` is set.
    /// Returns the number of keys deleted.
    fn delete(&self, key: &str, prefix: bool) -> QueueResult<u64>;
}

/// The `range_end` that turns a range request into a prefix scan.
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // All 0xff (or empty): scan to the end of the keyspace.
    vec![0]
}

pub fn range_request(prefix: &str) -> Value {
    json!({
        "key": STANDARD.encode(prefix),
        "range_end": STANDARD.encode(prefix_range_end(prefix.as_bytes())),
    })
}

pub fn put_request(key: &str, value: &[u8]) -> Value {
    json!({ "key": STANDARD.encode(key), "value": STANDARD.encode(value) })
}

pub fn delete_request(key: &str, prefix: bool) -> Value {
    if prefix {
        range_request(key)
    } else {
        json!({ "key": STANDARD.encode(key) })
    }
}

fn decode_field(field: &Value, name: &str) -> QueueResult<Vec<u8>> {
    let encoded = field.as_str().unwrap_or_default();
    STANDARD
        .decode(encoded)
        .map_err(|e| QueueError::Serialization(format!("etcd {name}: {e}")))
}

/// Decode a `/v3/kv/range` response. `kvs` is omitted when nothing matched.
pub fn decode_range_response(body: &Value) -> QueueResult<Vec<(String, Vec<u8>)>> {
    let Some(kvs) = body.get("kvs").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    kvs.iter()
        .map(|kv| {
            let key = decode_field(&kv["key"], "key")?;
            let key = String::from_utf8(key)
                .map_err(|e| QueueError::Serialization(format!("etcd key: {e}")))?;
            let value = decode_field(&kv["value"], "value")?;
            Ok((key, value))
        })
        .collect()
}

/// `deleted` is an int64, which the gateway renders as a string.
pub fn decode_deleted(body: &Value) -> u64 {
    match body.get("deleted") {
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        _ => 0,
    }
}

#[derive(Debug)]
pub struct EtcdConfigBackend<C: EtcdKv> {
    client: C,
    prefix: String,
}

impl<C: EtcdKv> EtcdConfigBackend<C> {
    pub fn new(client: C, prefix: Option<String>) -> Self {
        Self {
            client,
            prefix: prefix.unwrap_or_else(|| DEFAULT_ETCD_PREFIX.to_string()),
        }
    }

    fn tenant_root(&self, tenant: &TenantId) -> String {
        format!("{}/{}/", self.prefix, tenant)
    }
}

impl<C: EtcdKv> ConfigBackend for EtcdConfigBackend<C> {
    fn load(&self, tenant: &TenantId) -> QueueResult<ConfigEntries> {
        let mut entries = ConfigEntries::new();
        for (path, raw) in self.client.range(&self.tenant_root(tenant))? {
            if let Some(key) = key_from_slash_path(&self.prefix, tenant, &path) {
                entries.insert(key, serde_json::from_slice(&raw)?);
            }
        }
        Ok(entries)
    }

    fn store(&self, tenant: &TenantId, key: &str, value: &Value) -> QueueResult<()> {
        self.client.put(
            &slash_path(&self.prefix, tenant, key),
            &serde_json::to_vec(value)?,
        )
    }

    fn remove(&self, tenant: &TenantId, key: &str) -> QueueResult<bool> {
        Ok(self.client.delete(&slash_path(&self.prefix, tenant, key), false)? > 0)
    }

    fn remove_all(&self, tenant: &TenantId) -> QueueResult<()> {
        self.client.delete(&self.tenant_root(tenant), true)?;
        Ok(())
    }
}

/// In-process etcd stand-in that speaks the gateway's JSON shapes, so the
/// same encode/decode helpers as the HTTP client are exercised. Clones share
/// state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEtcdKv {
    entries: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl InMemoryEtcdKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle_range(&self, request: &Value) -> QueueResult<Value> {
        let start = decode_field(&request["key"], "key")?;
        let end = decode_field(&request["range_end"], "range_end")?;
        let entries = self.entries.read().unwrap();
        let kvs: Vec<Value> = entries
            .range(start..)
            .take_while(|(k, _)| end.as_slice() == [0u8].as_slice() || **k < end)
            .map(|(k, v)| json!({ "key": STANDARD.encode(k), "value": STANDARD.encode(v) }))
            .collect();
        if kvs.is_empty() {
            Ok(json!({ "count": "0" }))
        } else {
            Ok(json!({ "kvs": kvs, "count": kvs.len().to_string() }))
        }
    }
}

impl EtcdKv for InMemoryEtcdKv {
    fn range(&self, prefix: &str) -> QueueResult<Vec<(String, Vec<u8>)>> {
        decode_range_response(&self.handle_range(&range_request(prefix))?)
    }

    fn put(&self, key: &str, value: &[u8]) -> QueueResult<()> {
        let request = put_request(key, value);
        let key = decode_field(&request["key"], "key")?;
        let value = decode_field(&request["value"], "value")?;
        self.entries.write().unwrap().insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &str, prefix: bool) -> QueueResult<u64> {
        let mut entries = self.entries.write().unwrap();
        let deleted = if prefix {
            let before = entries.len();
            entries.retain(|k, _| !k.starts_with(key.as_bytes()));
            before - entries.len()
        } else {
            usize::from(entries.remove(key.as_bytes()).is_some())
        };
        Ok(deleted as u64)
    }
}

#[cfg(feature = "etcd")]
pub use http::HttpEtcdKv;

#[cfg(feature = "etcd")]
mod http {
    use std::time::Duration;

    use serde_json::Value;

    use jobline_core::{QueueError, QueueResult};

    use super::{
        EtcdKv, decode_deleted, decode_range_response, delete_request, put_request, range_request,
    };

    /// etcd v3 JSON gateway client (`/v3/kv/*`).
    #[derive(Debug, Clone)]
    pub struct HttpEtcdKv {
        base_url: String,
        client: reqwest::blocking::Client,
    }

    fn kv_err(e: reqwest::Error) -> QueueError {
        QueueError::store(format!("etcd request failed: {e}"))
    }

    impl HttpEtcdKv {
        pub fn new(base_url: &str) -> QueueResult<Self> {
            let client = reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .map_err(kv_err)?;
            Ok(Self {
                base_url: base_url.trim_end_matches('/').to_string(),
                client,
            })
        }

        fn call(&self, endpoint: &str, body: &Value) -> QueueResult<Value> {
            self.client
                .post(format!("{}/v3/kv/{endpoint}", self.base_url))
                .json(body)
                .send()
                .and_then(|r| r.error_for_status())
                .and_then(|r| r.json::<Value>())
                .map_err(kv_err)
        }
    }

    impl EtcdKv for HttpEtcdKv {
        fn range(&self, prefix: &str) -> QueueResult<Vec<(String, Vec<u8>)>> {
            decode_range_response(&self.call("range", &range_request(prefix))?)
        }

        fn put(&self, key: &str, value: &[u8]) -> QueueResult<()> {
            self.call("put", &put_request(key, value))?;
            Ok(())
        }

        fn delete(&self, key: &str, prefix: bool) -> QueueResult<u64> {
            Ok(decode_deleted(&self.call("deleterange", &delete_request(key, prefix))?))
        }
    }
}
