//! Peer directory: the continuously-updated list of known nodes.
//!
//! The gateway core only reads it. [`InMemoryDirectory`] is the concrete
//! directory fed by the local fabric and by the discovery poller.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// One capability advertised by a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Defaults to the method name when a node serves a method once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    pub method: String,
    /// JSON Schema the node accepts for this method
    #[serde(default)]
    pub schema: Value,
}

impl ServiceInfo {
    pub fn id(&self) -> &str {
        self.service_id.as_deref().unwrap_or(&self.method)
    }
}

/// What the directory knows about one node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// service id -> capability
    #[serde(default)]
    pub service_info: HashMap<String, ServiceInfo>,
}

impl NodeInfo {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn serves(&self, method: &str) -> bool {
        self.service_info.values().any(|s| s.method == method)
    }
}

pub type DirectorySnapshot = Arc<Vec<NodeInfo>>;

/// Read side of the peer directory.
pub trait PeerDirectory: Send + Sync {
    /// Current list of known nodes
    fn snapshot(&self) -> DirectorySnapshot;

    /// Change stream; every published snapshot is observable through it.
    fn subscribe(&self) -> watch::Receiver<DirectorySnapshot>;
}

/// Directory held in memory and pushed to subscribers through a watch channel.
pub struct InMemoryDirectory {
    tx: watch::Sender<DirectorySnapshot>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(Vec::new()));
        Self { tx }
    }

    /// Replaces the whole directory.
    pub fn publish(&self, nodes: Vec<NodeInfo>) {
        self.tx.send_replace(Arc::new(nodes));
    }

    /// Inserts or replaces one node, keeping registration order.
    pub fn upsert(&self, info: NodeInfo) {
        self.tx.send_modify(|snapshot| {
            let mut nodes = snapshot.as_ref().clone();
            match nodes.iter_mut().find(|n| n.node_id == info.node_id) {
                Some(existing) => *existing = info,
                None => nodes.push(info),
            }
            *snapshot = Arc::new(nodes);
        });
    }

    pub fn remove(&self, node_id: &str) {
        self.tx.send_if_modified(|snapshot| {
            if !snapshot.iter().any(|n| n.node_id == node_id) {
                return false;
            }
            let nodes = snapshot
                .iter()
                .filter(|n| n.node_id != node_id)
                .cloned()
                .collect();
            *snapshot = Arc::new(nodes);
            true
        });
    }

    pub fn get(&self, node_id: &str) -> Option<NodeInfo> {
        self.tx.borrow().iter().find(|n| n.node_id == node_id).cloned()
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerDirectory for InMemoryDirectory {
    fn snapshot(&self) -> DirectorySnapshot {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<DirectorySnapshot> {
        self.tx.subscribe()
    }
}

/// This process's identity on the fabric. Watchers, waits and service
/// registrations bound to the handle end when it is disposed.
#[derive(Clone)]
pub struct NodeHandle {
    node_id: Arc<str>,
    disposed: CancellationToken,
}

impl NodeHandle {
    pub fn new(node_id: impl Into<String>) -> Self {
        let node_id: String = node_id.into();
        Self {
            node_id: Arc::from(node_id),
            disposed: CancellationToken::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn dispose(&self) {
        if !self.disposed.is_cancelled() {
            tracing::debug!(node_id = %self.node_id, "node handle disposed");
        }
        self.disposed.cancel();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.is_cancelled()
    }

    /// Completes once the handle is disposed.
    pub async fn disposed(&self) {
        self.disposed.cancelled().await
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.disposed.clone()
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("node_id", &self.node_id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_keeps_registration_order() {
        let dir = InMemoryDirectory::new();
        dir.upsert(NodeInfo::new("b"));
        dir.upsert(NodeInfo::new("a"));
        let mut updated = NodeInfo::new("b");
        updated.tags.insert("region".into(), "us-west".into());
        dir.upsert(updated);

        let snapshot = dir.snapshot();
        let ids: Vec<&str> = snapshot.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(snapshot[0].tag("region"), Some("us-west"));
    }

    #[tokio::test]
    async fn test_subscribers_observe_changes() {
        let dir = InMemoryDirectory::new();
        let mut rx = dir.subscribe();
        dir.upsert(NodeInfo::new("n1"));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().len(), 1);

        dir.remove("missing");
        assert!(!rx.has_changed().unwrap());
        dir.remove("n1");
        assert!(rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_node_handle_dispose() {
        let node = NodeHandle::new("n0");
        let waiter = node.clone();
        let task = tokio::spawn(async move { waiter.disposed().await });
        assert!(!node.is_disposed());
        node.dispose();
        task.await.unwrap();
        assert!(node.is_disposed());
    }
}
