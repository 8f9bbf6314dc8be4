//! ZooKeeper layout: one znode per key segment under
//! `{root}/{tenant}/{seg}/{seg}`. Leaf data is the JSON-encoded value;
//! intermediate znodes are created on demand with empty data.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::debug;

use jobline_core::{QueueError, QueueResult, TenantId};

use super::provider::{ConfigBackend, ConfigEntries};
use super::{key_from_slash_path, slash_path};

pub const DEFAULT_ZNODE_ROOT: &str = "/jobline/config";

/// Minimal znode surface.
pub trait ZnodeClient: Send + Sync {
    fn exists(&self, path: &str) -> QueueResult<bool>;

    /// Create `path`; the parent must exist. Returns `false` if the node was
    /// already there.
    fn create(&self, path: &str, data: &[u8]) -> QueueResult<bool>;

    fn get_data(&self, path: &str) -> QueueResult<Option<Vec<u8>>>;

    fn set_data(&self, path: &str, data: &[u8]) -> QueueResult<()>;

    /// Child names (not full paths); empty for a missing node.
    fn children(&self, path: &str) -> QueueResult<Vec<String>>;

    /// Delete a childless node. Missing nodes are ignored.
    fn delete(&self, path: &str) -> QueueResult<()>;
}

/// Every ancestor of `path`, outermost first (`/a/b/c` -> `/a`, `/a/b`).
pub fn ancestors(path: &str) -> Vec<String> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    (1..segments.len())
        .map(|n| format!("/{}", segments[..n].join("/")))
        .collect()
}

fn child_path(parent: &str, child: &str) -> String {
    format!("{}/{child}", parent.trim_end_matches('/'))
}

#[derive(Debug)]
pub struct ZookeeperConfigBackend<C: ZnodeClient> {
    client: C,
    root: String,
}

impl<C: ZnodeClient> ZookeeperConfigBackend<C> {
    pub fn new(client: C, root: Option<String>) -> Self {
        Self {
            client,
            root: root.unwrap_or_else(|| DEFAULT_ZNODE_ROOT.to_string()),
        }
    }

    fn tenant_root(&self, tenant: &TenantId) -> String {
        format!("{}/{}", self.root, tenant)
    }

    fn ensure_parents(&self, path: &str) -> QueueResult<()> {
        for ancestor in ancestors(path) {
            if !self.client.exists(&ancestor)? && self.client.create(&ancestor, &[])? {
                debug!(path = %ancestor, "znode created");
            }
        }
        Ok(())
    }

    fn collect(
        &self,
        path: &str,
        tenant: &TenantId,
        entries: &mut ConfigEntries,
    ) -> QueueResult<()> {
        for child in self.client.children(path)? {
            let node = child_path(path, &child);
            if let Some(data) = self.client.get_data(&node)? {
                if !data.is_empty() {
                    if let Some(key) = key_from_slash_path(&self.root, tenant, &node) {
                        entries.insert(key, serde_json::from_slice(&data)?);
                    }
                }
            }
            self.collect(&node, tenant, entries)?;
        }
        Ok(())
    }

    fn delete_tree(&self, path: &str) -> QueueResult<()> {
        for child in self.client.children(path)? {
            self.delete_tree(&child_path(path, &child))?;
        }
        self.client.delete(path)
    }
}

impl<C: ZnodeClient> ConfigBackend for ZookeeperConfigBackend<C> {
    fn load(&self, tenant: &TenantId) -> QueueResult<ConfigEntries> {
        let mut entries = ConfigEntries::new();
        self.collect(&self.tenant_root(tenant), tenant, &mut entries)?;
        Ok(entries)
    }

    fn store(&self, tenant: &TenantId, key: &str, value: &Value) -> QueueResult<()> {
        let path = slash_path(&self.root, tenant, key);
        let data = serde_json::to_vec(value)?;
        self.ensure_parents(&path)?;
        if !self.client.create(&path, &data)? {
            self.client.set_data(&path, &data)?;
        }
        Ok(())
    }

    fn remove(&self, tenant: &TenantId, key: &str) -> QueueResult<bool> {
        let path = slash_path(&self.root, tenant, key);
        let had_value = self
            .client
            .get_data(&path)?
            .is_some_and(|data| !data.is_empty());
        if !had_value {
            return Ok(false);
        }
        // A node that is also a parent keeps its children; only the value goes.
        if self.client.children(&path)?.is_empty() {
            self.client.delete(&path)?;
        } else {
            self.client.set_data(&path, &[])?;
        }
        Ok(true)
    }

    fn remove_all(&self, tenant: &TenantId) -> QueueResult<()> {
        self.delete_tree(&self.tenant_root(tenant))
    }
}

/// In-process znode tree with ZooKeeper's parent/child rules. Clones share
/// state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryZnodeTree {
    nodes: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryZnodeTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paths(&self) -> Vec<String> {
        self.nodes.read().unwrap().keys().cloned().collect()
    }
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) | None => None,
        Some(i) => Some(&path[..i]),
    }
}

fn direct_children<'a>(
    nodes: &'a BTreeMap<String, Vec<u8>>,
    path: &'a str,
) -> impl Iterator<Item = &'a str> + 'a {
    let prefix = format!("{}/", path.trim_end_matches('/'));
    nodes
        .keys()
        .filter_map(move |k| k.strip_prefix(prefix.as_str()).map(|rest| (k, rest)))
        .filter(|(_, rest)| !rest.contains('/'))
        .map(|(_, rest)| rest)
}

impl ZnodeClient for InMemoryZnodeTree {
    fn exists(&self, path: &str) -> QueueResult<bool> {
        Ok(self.nodes.read().unwrap().contains_key(path))
    }

    fn create(&self, path: &str, data: &[u8]) -> QueueResult<bool> {
        let mut nodes = self.nodes.write().unwrap();
        if let Some(parent) = parent_of(path) {
            if !nodes.contains_key(parent) {
                return Err(QueueError::NotFound(format!("znode {parent}")));
            }
        }
        if nodes.contains_key(path) {
            return Ok(false);
        }
        nodes.insert(path.to_string(), data.to_vec());
        Ok(true)
    }

    fn get_data(&self, path: &str) -> QueueResult<Option<Vec<u8>>> {
        Ok(self.nodes.read().unwrap().get(path).cloned())
    }

    fn set_data(&self, path: &str, data: &[u8]) -> QueueResult<()> {
        let mut nodes = self.nodes.write().unwrap();
        match nodes.get_mut(path) {
            Some(existing) => {
                *existing = data.to_vec();
                Ok(())
            }
            None => Err(QueueError::NotFound(format!("znode {path}"))),
        }
    }

    fn children(&self, path: &str) -> QueueResult<Vec<String>> {
        let nodes = self.nodes.read().unwrap();
        Ok(direct_children(&nodes, path).map(str::to_string).collect())
    }

    fn delete(&self, path: &str) -> QueueResult<()> {
        let mut nodes = self.nodes.write().unwrap();
        if direct_children(&nodes, path).next().is_some() {
            return Err(QueueError::store(format!("znode {path} is not empty")));
        }
        nodes.remove(path);
        Ok(())
    }
}

#[cfg(feature = "zookeeper")]
pub use client::ZookeeperClient;

#[cfg(feature = "zookeeper")]
mod client {
    use std::time::Duration;

    use tracing::debug;
    use zookeeper::{Acl, CreateMode, WatchedEvent, Watcher, ZkError, ZooKeeper};

    use jobline_core::{QueueError, QueueResult};

    use super::ZnodeClient;

    struct SessionWatcher;

    impl Watcher for SessionWatcher {
        fn handle(&self, event: WatchedEvent) {
            debug!(state = ?event.keeper_state, "zookeeper session event");
        }
    }

    fn zk_err(e: ZkError) -> QueueError {
        QueueError::store(format!("zookeeper: {e:?}"))
    }

    /// Blocking ZooKeeper session.
    pub struct ZookeeperClient {
        zk: ZooKeeper,
    }

    impl ZookeeperClient {
        pub fn connect(hosts: &str, session_timeout: Duration) -> QueueResult<Self> {
            let zk = ZooKeeper::connect(hosts, session_timeout, SessionWatcher).map_err(zk_err)?;
            Ok(Self { zk })
        }
    }

    impl core::fmt::Debug for ZookeeperClient {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            f.debug_struct("ZookeeperClient").finish()
        }
    }

    impl ZnodeClient for ZookeeperClient {
        fn exists(&self, path: &str) -> QueueResult<bool> {
            Ok(self.zk.exists(path, false).map_err(zk_err)?.is_some())
        }

        fn create(&self, path: &str, data: &[u8]) -> QueueResult<bool> {
            match self.zk.create(
                path,
                data.to_vec(),
                Acl::open_unsafe().clone(),
                CreateMode::Persistent,
            ) {
                Ok(_) => Ok(true),
                Err(ZkError::NodeExists) => Ok(false),
                Err(ZkError::NoNode) => {
                    Err(QueueError::NotFound(format!("parent of znode {path}")))
                }
                Err(e) => Err(zk_err(e)),
            }
        }

        fn get_data(&self, path: &str) -> QueueResult<Option<Vec<u8>>> {
            match self.zk.get_data(path, false) {
                Ok((data, _)) => Ok(Some(data)),
                Err(ZkError::NoNode) => Ok(None),
                Err(e) => Err(zk_err(e)),
            }
        }

        fn set_data(&self, path: &str, data: &[u8]) -> QueueResult<()> {
            self.zk
                .set_data(path, data.to_vec(), None)
                .map(|_| ())
                .map_err(zk_err)
        }

        fn children(&self, path: &str) -> QueueResult<Vec<String>> {
            match self.zk.get_children(path, false) {
                Ok(children) => Ok(children),
                Err(ZkError::NoNode) => Ok(Vec::new()),
                Err(e) => Err(zk_err(e)),
            }
        }

        fn delete(&self, path: &str) -> QueueResult<()> {
            match self.zk.delete(path, None) {
                Ok(()) | Err(ZkError::NoNode) => Ok(()),
                Err(e) => Err(zk_err(e)),
            }
        }
    }
}
