//! Proxy pool: the trust-filtered egress IPs currently offered by proxy
//! nodes, cached behind a change signature.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::proxy::directory::{NodeHandle, NodeInfo, PeerDirectory};
use crate::proxy::error::{ProxyError, Result};
use crate::proxy::trust::{
    is_http_proxy_node, trusted_candidates_with, Candidate, LogThrottle, TrustedNodeIds,
    IP_SOURCE_TAG, IP_TAG,
};

pub const PROXY_IP_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
struct PoolCache {
    signature: Option<String>,
    ips: Vec<String>,
    cursor: usize,
}

struct PoolInner {
    directory: Arc<dyn PeerDirectory>,
    trusted: TrustedNodeIds,
    node_id: String,
    cache: Mutex<PoolCache>,
    throttle: Mutex<LogThrottle>,
}

/// Deterministic fold of `(node_id, ip, ip_source)` over proxy nodes,
/// sorted by node id.
pub fn pool_signature(nodes: &[NodeInfo]) -> String {
    let mut entries: Vec<(&str, &str, &str)> = nodes
        .iter()
        .filter(|n| is_http_proxy_node(n))
        .map(|n| {
            (
                n.node_id.as_str(),
                n.tag(IP_TAG).unwrap_or(""),
                n.tag(IP_SOURCE_TAG).unwrap_or(""),
            )
        })
        .collect();
    entries.sort();
    entries
        .iter()
        .map(|(id, ip, source)| format!("{}:{}:{}", id, ip, source))
        .collect::<Vec<_>>()
        .join("|")
}

impl PoolInner {
    fn cache(&self) -> MutexGuard<'_, PoolCache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn throttle(&self) -> MutexGuard<'_, LogThrottle> {
        self.throttle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn candidates(&self, nodes: &[NodeInfo]) -> Vec<Candidate> {
        if self.trusted.is_empty() {
            if self.throttle().should_log("allow_list_empty") {
                tracing::warn!(node_id = %self.node_id, "trusted proxy allow-list is empty, denying all proxy nodes");
            }
            return Vec::new();
        }
        trusted_candidates_with(nodes, &self.trusted, |info, rejection| {
            let key = format!("{}:{:?}", info.node_id, rejection);
            if self.throttle().should_log(&key) {
                tracing::warn!(
                    proxy_node = %info.node_id,
                    reason = rejection.as_str(),
                    "proxy node excluded from pool"
                );
            }
        })
    }

    /// Rebuilds the cache unless the signature is unchanged.
    fn rebuild(&self, nodes: &[NodeInfo]) {
        let signature = pool_signature(nodes);
        {
            let cache = self.cache();
            if cache.signature.as_deref() == Some(signature.as_str()) {
                return;
            }
        }
        let ips: Vec<String> = self.candidates(nodes).into_iter().map(|c| c.ip).collect();
        let mut cache = self.cache();
        if cache.cursor >= ips.len() {
            cache.cursor = 0;
        }
        tracing::debug!(node_id = %self.node_id, count = ips.len(), "proxy pool rebuilt");
        cache.ips = ips;
        cache.signature = Some(signature);
    }

    fn clear(&self) {
        *self.cache() = PoolCache::default();
    }
}

/// Watches the peer directory and keeps the proxy IP list current.
///
/// The watcher runs between [`ProxyPool::start`] and [`ProxyPool::stop`],
/// and stops on its own when the owning [`NodeHandle`] is disposed.
pub struct ProxyPool {
    inner: Arc<PoolInner>,
    stopped: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyPool {
    pub fn new(
        directory: Arc<dyn PeerDirectory>,
        node: &NodeHandle,
        trusted: TrustedNodeIds,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                directory,
                trusted,
                node_id: node.node_id().to_string(),
                cache: Mutex::new(PoolCache::default()),
                throttle: Mutex::new(LogThrottle::default()),
            }),
            stopped: node.token().child_token(),
            task: Mutex::new(None),
        }
    }

    pub fn trusted(&self) -> &TrustedNodeIds {
        &self.inner.trusted
    }

    /// Spawns the directory watcher. Calling it again is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() || self.stopped.is_cancelled() {
            return;
        }
        let inner = self.inner.clone();
        let stopped = self.stopped.clone();
        let mut rx = inner.directory.subscribe();
        let initial = rx.borrow_and_update().clone();
        inner.rebuild(&initial);

        *task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = rx.borrow_and_update().clone();
                        inner.rebuild(&snapshot);
                    }
                }
            }
            inner.clear();
            tracing::debug!(node_id = %inner.node_id, "proxy pool watcher stopped");
        }));
    }

    /// Stops the watcher and drops the cache.
    pub fn stop(&self) {
        self.stopped.cancel();
        self.inner.clear();
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Forces a rebuild from the current directory snapshot.
    pub fn refresh(&self) {
        if self.is_stopped() {
            return;
        }
        let snapshot = self.inner.directory.snapshot();
        self.inner.rebuild(&snapshot);
    }

    /// Trusted candidates computed from the current directory snapshot.
    pub fn candidates(&self) -> Vec<Candidate> {
        if self.is_stopped() {
            return Vec::new();
        }
        let snapshot = self.inner.directory.snapshot();
        self.inner.candidates(&snapshot)
    }

    /// Cached, trust-filtered egress IPs in candidate order.
    pub fn list_ips(&self) -> Vec<String> {
        if self.is_stopped() {
            return Vec::new();
        }
        let built = self.inner.cache().signature.is_some();
        if !built {
            self.refresh();
        }
        self.inner.cache().ips.clone()
    }

    /// Resolves with the IP list once it is non-empty, or fails with
    /// `E_PROXY_TARGET_NOT_FOUND` after `timeout`.
    pub async fn wait_for_ips(&self, timeout: Duration) -> Result<Vec<String>> {
        let mut rx = self.inner.directory.subscribe();
        let snapshot = rx.borrow_and_update().clone();
        if !self.is_stopped() {
            self.inner.rebuild(&snapshot);
        }
        let ips = self.list_ips();
        if !ips.is_empty() {
            return Ok(ips);
        }

        let wait = async {
            loop {
                if rx.changed().await.is_err() {
                    return None;
                }
                let snapshot = rx.borrow_and_update().clone();
                self.inner.rebuild(&snapshot);
                let ips = self.inner.cache().ips.clone();
                if !ips.is_empty() {
                    return Some(ips);
                }
            }
        };

        let outcome = tokio::select! {
            _ = self.stopped.cancelled() => Err("disposed"),
            found = tokio::time::timeout(timeout, wait) => match found {
                Ok(Some(ips)) => Ok(ips),
                Ok(None) => Err("directory_closed"),
                Err(_) => Err("wait_timeout"),
            },
        };

        outcome.map_err(|reason| {
            if self.inner.throttle().should_log(reason) {
                tracing::warn!(
                    node_id = %self.inner.node_id,
                    timeout_ms = timeout.as_millis() as u64,
                    reason,
                    "no proxy ip available"
                );
            }
            ProxyError::TargetNotFound {
                reason,
                node_id: self.inner.node_id.clone(),
                base_key: None,
                timeout_ms: Some(timeout.as_millis() as u64),
            }
        })
    }

    /// Next IP in pool order, independent of any quota.
    pub fn select_ip_round_robin(&self) -> Result<String> {
        if self.inner.cache().signature.is_none() {
            self.refresh();
        }
        let mut cache = self.inner.cache();
        if cache.ips.is_empty() || self.is_stopped() {
            return Err(ProxyError::TargetNotFound {
                reason: "empty_pool",
                node_id: self.inner.node_id.clone(),
                base_key: None,
                timeout_ms: None,
            });
        }
        let len = cache.ips.len();
        let idx = cache.cursor % len;
        cache.cursor = (idx + 1) % len;
        Ok(cache.ips[idx].clone())
    }

    /// Like [`select_ip_round_robin`](Self::select_ip_round_robin), waiting
    /// up to `timeout` for the pool to fill.
    pub async fn select_ip_round_robin_wait(&self, timeout: Duration) -> Result<String> {
        self.wait_for_ips(timeout).await?;
        self.select_ip_round_robin()
    }
}

impl Drop for ProxyPool {
    fn drop(&mut self) {
        self.stopped.cancel();
    }
}
