//! Consul KV layout: `{prefix}/{tenant}/{seg}/{seg}` holding the
//! JSON-encoded value. Consul returns values base64-encoded in listings.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::Value;

use jobline_core::{QueueError, QueueResult, TenantId};

use super::provider::{ConfigBackend, ConfigEntries};
use super::{key_from_slash_path, slash_path};

pub const DEFAULT_CONSUL_PREFIX: &str = "jobline/config";

/// Minimal Consul KV surface. Values are raw (already decoded) bytes.
pub trait ConsulKv: Send + Sync {
    fn get(&self, path: &str) -> QueueResult<Option<Vec<u8>>>;

    /// Every entry at or below `prefix`.
    fn list(&self, prefix: &str) -> QueueResult<Vec<(String, Vec<u8>)>>;

    fn put(&self, path: &str, value: &[u8]) -> QueueResult<()>;

    fn delete(&self, path: &str, recurse: bool) -> QueueResult<()>;
}

#[derive(Debug, Deserialize)]
struct ListingEntry {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
}

/// Decode a `GET /v1/kv/<prefix>?recurse` response body.
pub fn decode_listing(body: &[u8]) -> QueueResult<Vec<(String, Vec<u8>)>> {
    let listing: Vec<ListingEntry> = serde_json::from_slice(body)?;
    listing
        .into_iter()
        .map(|entry| {
            let value = match entry.value {
                Some(encoded) => STANDARD
                    .decode(encoded)
                    .map_err(|e| QueueError::Serialization(format!("{}: {e}", entry.key)))?,
                None => Vec::new(),
            };
            Ok((entry.key, value))
        })
        .collect()
}

#[derive(Debug)]
pub struct ConsulConfigBackend<C: ConsulKv> {
    client: C,
    prefix: String,
}

impl<C: ConsulKv> ConsulConfigBackend<C> {
    pub fn new(client: C, prefix: Option<String>) -> Self {
        Self {
            client,
            prefix: prefix.unwrap_or_else(|| DEFAULT_CONSUL_PREFIX.to_string()),
        }
    }

    fn tenant_root(&self, tenant: &TenantId) -> String {
        format!("{}/{}/", self.prefix, tenant)
    }
}

impl<C: ConsulKv> ConfigBackend for ConsulConfigBackend<C> {
    fn load(&self, tenant: &TenantId) -> QueueResult<ConfigEntries> {
        let mut entries = ConfigEntries::new();
        for (path, raw) in self.client.list(&self.tenant_root(tenant))? {
            // Folder placeholders carry no value.
            if raw.is_empty() {
                continue;
            }
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
        let path = slash_path(&self.prefix, tenant, key);
        let existed = self.client.get(&path)?.is_some();
        self.client.delete(&path, false)?;
        Ok(existed)
    }

    fn remove_all(&self, tenant: &TenantId) -> QueueResult<()> {
        self.client.delete(&self.tenant_root(tenant), true)
    }
}

/// In-process Consul KV stand-in. Listings go through the same base64 wire
/// decoding as the HTTP client. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryConsulKv {
    entries: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryConsulKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConsulKv for InMemoryConsulKv {
    fn get(&self, path: &str) -> QueueResult<Option<Vec<u8>>> {
        Ok(self.entries.read().unwrap().get(path).cloned())
    }

    fn list(&self, prefix: &str) -> QueueResult<Vec<(String, Vec<u8>)>> {
        let listing: Vec<Value> = self
            .entries
            .read()
            .unwrap()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| serde_json::json!({ "Key": k, "Value": STANDARD.encode(v) }))
            .collect();
        decode_listing(&serde_json::to_vec(&listing)?)
    }

    fn put(&self, path: &str, value: &[u8]) -> QueueResult<()> {
        self.entries
            .write()
            .unwrap()
            .insert(path.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, path: &str, recurse: bool) -> QueueResult<()> {
        let mut entries = self.entries.write().unwrap();
        if recurse {
            entries.retain(|k, _| !k.starts_with(path));
        } else {
            entries.remove(path);
        }
        Ok(())
    }
}

#[cfg(feature = "consul")]
pub use http::HttpConsulKv;

#[cfg(feature = "consul")]
mod http {
    use std::time::Duration;

    use jobline_core::{QueueError, QueueResult};

    use super::{ConsulKv, decode_listing};

    /// Consul agent HTTP API client (`/v1/kv`).
    #[derive(Debug, Clone)]
    pub struct HttpConsulKv {
        base_url: String,
        token: Option<String>,
        client: reqwest::blocking::Client,
    }

    fn kv_err(e: reqwest::Error) -> QueueError {
        QueueError::store(format!("consul request failed: {e}"))
    }

    impl HttpConsulKv {
        pub fn new(base_url: &str, token: Option<String>) -> QueueResult<Self> {
            let client = reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .map_err(kv_err)?;
            Ok(Self {
                base_url: base_url.trim_end_matches('/').to_string(),
                token,
                client,
            })
        }

        fn url(&self, path: &str) -> String {
            format!("{}/v1/kv/{}", self.base_url, path.trim_start_matches('/'))
        }

        fn request(
            &self,
            builder: reqwest::blocking::RequestBuilder,
        ) -> QueueResult<reqwest::blocking::Response> {
            let builder = match &self.token {
                Some(token) => builder.header("X-Consul-Token", token),
                None => builder,
            };
            builder.send().map_err(kv_err)
        }
    }

    impl ConsulKv for HttpConsulKv {
        fn get(&self, path: &str) -> QueueResult<Option<Vec<u8>>> {
            let response = self.request(self.client.get(self.url(path)).query(&[("raw", "true")]))?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }
            let response = response.error_for_status().map_err(kv_err)?;
            Ok(Some(response.bytes().map_err(kv_err)?.to_vec()))
        }

        fn list(&self, prefix: &str) -> QueueResult<Vec<(String, Vec<u8>)>> {
            let response =
                self.request(self.client.get(self.url(prefix)).query(&[("recurse", "true")]))?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(Vec::new());
            }
            let response = response.error_for_status().map_err(kv_err)?;
            decode_listing(&response.bytes().map_err(kv_err)?)
        }

        fn put(&self, path: &str, value: &[u8]) -> QueueResult<()> {
            self.request(self.client.put(self.url(path)).body(value.to_vec()))?
                .error_for_status()
                .map_err(kv_err)?;
            Ok(())
        }

        fn delete(&self, path: &str, recurse: bool) -> QueueResult<()> {
            let mut builder = self.client.delete(self.url(path));
            if recurse {
                builder = builder.query(&[("recurse", "true")]);
            }
            self.request(builder)?.error_for_status().map_err(kv_err)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn listing_values_are_base64_decoded() {
        let body = br#"[{"Key":"jobline/config/acme/a/b","Value":"MQ=="},{"Key":"jobline/config/acme/","Value":null}]"#;
        let listing = decode_listing(body).unwrap();
        assert_eq!(listing[0], ("jobline/config/acme/a/b".to_string(), b"1".to_vec()));
        assert!(listing[1].1.is_empty());
    }

    #[test]
    fn bad_base64_is_a_serialization_error() {
        let body = br#"[{"Key":"k","Value":"***"}]"#;
        assert!(matches!(decode_listing(body), Err(QueueError::Serialization(_))));
    }

    #[test]
    fn backend_stores_under_slash_paths() {
        let kv = InMemoryConsulKv::new();
        let backend = ConsulConfigBackend::new(kv.clone(), None);
        let t = TenantId::new("acme");

        backend.store(&t, "kafka.connections.kafka.brokers", &json!("b:9092")).unwrap();
        assert_eq!(
            kv.get("jobline/config/acme/kafka/connections/kafka/brokers").unwrap(),
            Some(br#""b:9092""#.to_vec())
        );

        let loaded = backend.load(&t).unwrap();
        assert_eq!(loaded["kafka.connections.kafka.brokers"], json!("b:9092"));

        assert!(backend.remove(&t, "kafka.connections.kafka.brokers").unwrap());
        assert!(!backend.remove(&t, "kafka.connections.kafka.brokers").unwrap());
    }

    #[test]
    fn remove_all_is_scoped_to_tenant() {
        let kv = InMemoryConsulKv::new();
        let backend = ConsulConfigBackend::new(kv, None);
        let (a, b) = (TenantId::new("a"), TenantId::new("b"));
        backend.store(&a, "x", &json!(1)).unwrap();
        backend.store(&b, "x", &json!(2)).unwrap();

        backend.remove_all(&a).unwrap();
        assert!(backend.load(&a).unwrap().is_empty());
        assert_eq!(backend.load(&b).unwrap()["x"], json!(2));
    }
}
