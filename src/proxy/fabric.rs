//! Messaging fabric: request/response between nodes, routed by matching
//! the request payload against the schema each node advertises for a
//! method.

use async_trait::async_trait;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::proxy::directory::{InMemoryDirectory, NodeHandle, NodeInfo, PeerDirectory, ServiceInfo};
use crate::proxy::error::{ProxyError, Result};
use crate::proxy::schema::schema_accepts;

/// Code carried by a response whose handler failed
pub const HANDLER_ERROR_CODE: i32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FabricResponse {
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl FabricResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            code: 0,
            message: "OK".to_string(),
            data: Some(data),
        }
    }

    pub fn from_error(err: &ProxyError) -> Self {
        Self {
            code: HANDLER_ERROR_CODE,
            message: err.to_string(),
            data: None,
        }
    }

    /// The payload, or the failure as a [`ProxyError::Remote`].
    pub fn into_result(self) -> Result<Value> {
        match (self.code, self.data) {
            (0, Some(data)) => Ok(data),
            (0, None) => Err(ProxyError::Remote {
                code: 0,
                message: "response carried no data".to_string(),
            }),
            (code, _) => Err(ProxyError::Remote {
                code,
                message: self.message,
            }),
        }
    }
}

#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn handle(&self, payload: Value) -> Result<Value>;
}

#[async_trait]
pub trait MessagingFabric: Send + Sync {
    /// Delivers `payload` to one node serving `method` whose schema
    /// accepts it. Failures are reported in the response, never panicked.
    async fn request(&self, method: &str, payload: Value) -> FabricResponse;
}

/// Nodes serving `method` whose advertised schema accepts `payload`.
pub fn resolve_candidates<'a>(nodes: &'a [NodeInfo], method: &str, payload: &Value) -> Vec<&'a NodeInfo> {
    nodes
        .iter()
        .filter(|node| {
            node.service_info
                .values()
                .any(|service| service.method == method && schema_accepts(&service.schema, payload))
        })
        .collect()
}

pub(crate) fn pick_random<'a>(candidates: &[&'a NodeInfo]) -> Option<&'a NodeInfo> {
    candidates.choose(&mut rand::thread_rng()).copied()
}

/// The services one node exposes, and the node info it advertises.
pub struct ServiceHost {
    node: NodeHandle,
    directory: Arc<InMemoryDirectory>,
    info: Mutex<NodeInfo>,
    handlers: DashMap<String, Arc<dyn ServiceHandler>>,
}

impl ServiceHost {
    pub fn new(node: NodeHandle, directory: Arc<InMemoryDirectory>) -> Arc<Self> {
        let host = Arc::new(Self {
            info: Mutex::new(NodeInfo::new(node.node_id())),
            node,
            directory,
            handlers: DashMap::new(),
        });
        host.publish();
        host
    }

    fn info(&self) -> MutexGuard<'_, NodeInfo> {
        self.info.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self) {
        if self.node.is_disposed() {
            return;
        }
        let info = self.info().clone();
        self.directory.upsert(info);
    }

    pub fn node(&self) -> &NodeHandle {
        &self.node
    }

    pub fn directory(&self) -> &Arc<InMemoryDirectory> {
        &self.directory
    }

    pub fn node_info(&self) -> NodeInfo {
        self.info().clone()
    }

    /// Merges `tags` into the advertised tags. Returns whether anything
    /// changed; the node info is republished only then.
    pub fn set_tags<I, K, V>(&self, tags: I) -> bool
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let changed = {
            let mut info = self.info();
            let mut changed = false;
            for (key, value) in tags {
                let (key, value) = (key.into(), value.into());
                if info.tags.get(&key) != Some(&value) {
                    info.tags.insert(key, value);
                    changed = true;
                }
            }
            changed
        };
        if changed {
            self.publish();
        }
        changed
    }

    pub fn tags(&self) -> HashMap<String, String> {
        self.info().tags.clone()
    }

    /// Serves `method` with `handler`, advertising `schema`.
    pub fn register(&self, method: &str, schema: Value, handler: Arc<dyn ServiceHandler>) {
        self.handlers.insert(method.to_string(), handler);
        self.info().service_info.insert(
            method.to_string(),
            ServiceInfo {
                service_id: None,
                method: method.to_string(),
                schema,
            },
        );
        tracing::info!(node_id = self.node.node_id(), method, "service registered");
        self.publish();
    }

    pub fn unregister(&self, method: &str) -> bool {
        let removed = self.handlers.remove(method).is_some();
        self.info().service_info.remove(method);
        if removed {
            tracing::info!(node_id = self.node.node_id(), method, "service withdrawn");
            self.publish();
        }
        removed
    }

    pub fn serves(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Runs the local handler for `method`.
    pub async fn dispatch(&self, method: &str, payload: Value) -> FabricResponse {
        let handler = match self.handlers.get(method) {
            Some(entry) if !self.node.is_disposed() => entry.value().clone(),
            _ => {
                return FabricResponse::from_error(&ProxyError::ServiceNotFound {
                    method: method.to_string(),
                })
            }
        };
        match handler.handle(payload).await {
            Ok(data) => FabricResponse::ok(data),
            Err(err) => FabricResponse::from_error(&err),
        }
    }

    /// Removes this node from the directory.
    pub fn withdraw(&self) {
        self.handlers.clear();
        self.directory.remove(self.node.node_id());
    }
}

/// In-process fabric over a shared directory. Every node it can reach is
/// attached with [`LocalFabric::attach`].
pub struct LocalFabric {
    directory: Arc<InMemoryDirectory>,
    hosts: DashMap<String, Arc<ServiceHost>>,
}

impl LocalFabric {
    pub fn new(directory: Arc<InMemoryDirectory>) -> Self {
        Self {
            directory,
            hosts: DashMap::new(),
        }
    }

    pub fn directory(&self) -> &Arc<InMemoryDirectory> {
        &self.directory
    }

    /// Creates and attaches a host for `node` on this fabric's directory.
    pub fn join(&self, node: NodeHandle) -> Arc<ServiceHost> {
        let host = ServiceHost::new(node, self.directory.clone());
        self.attach(host.clone());
        host
    }

    pub fn attach(&self, host: Arc<ServiceHost>) {
        self.hosts.insert(host.node().node_id().to_string(), host);
    }

    pub fn detach(&self, node_id: &str) {
        if let Some((_, host)) = self.hosts.remove(node_id) {
            host.withdraw();
        }
    }
}

#[async_trait]
impl MessagingFabric for LocalFabric {
    async fn request(&self, method: &str, payload: Value) -> FabricResponse {
        let host = {
            let snapshot = self.directory.snapshot();
            let attached: Vec<&NodeInfo> = resolve_candidates(&snapshot, method, &payload)
                .into_iter()
                .filter(|node| self.hosts.contains_key(&node.node_id))
                .collect();
            pick_random(&attached).and_then(|node| {
                self.hosts.get(&node.node_id).map(|h| h.value().clone())
            })
        };
        match host {
            Some(host) => host.dispatch(method, payload).await,
            None => FabricResponse::from_error(&ProxyError::ServiceNotFound {
                method: method.to_string(),
            }),
        }
    }
}
