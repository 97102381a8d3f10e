//! Peer discovery by polling each configured peer's `GET /api/node`.

use futures::future::join_all;
use reqwest::Client;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::proxy::directory::NodeInfo;
use crate::proxy::fabric::ServiceHost;

pub struct DiscoveryPoller {
    host: Arc<ServiceHost>,
    peers: Vec<String>,
    interval: Duration,
    client: Client,
}

impl DiscoveryPoller {
    pub fn new(host: Arc<ServiceHost>, peers: Vec<String>, interval: Duration) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(interval.max(Duration::from_secs(1)))
            .no_proxy()
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {}", e))?;
        Ok(Self {
            host,
            peers,
            interval,
            client,
        })
    }

    async fn fetch_peer(&self, peer: &str) -> Result<NodeInfo, String> {
        let url = format!("{}/api/node", peer.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("{}: {}", url, e))?
            .error_for_status()
            .map_err(|e| format!("{}: {}", url, e))?;
        response
            .json::<NodeInfo>()
            .await
            .map_err(|e| format!("{}: invalid node info: {}", url, e))
    }

    /// Polls every peer once and publishes local info plus whoever
    /// answered. Returns the number of reachable peers.
    pub async fn poll_once(&self) -> usize {
        let answers = join_all(self.peers.iter().map(|peer| self.fetch_peer(peer))).await;

        let local = self.host.node_info();
        let mut seen: HashSet<String> = HashSet::from([local.node_id.clone()]);
        let mut nodes = vec![local];
        let mut reachable = 0;
        for (peer, answer) in self.peers.iter().zip(answers) {
            match answer {
                Ok(info) => {
                    reachable += 1;
                    if seen.insert(info.node_id.clone()) {
                        nodes.push(info);
                    }
                }
                Err(e) => tracing::debug!(peer = %peer, "peer unreachable: {}", e),
            }
        }
        if !self.host.node().is_disposed() {
            self.host.directory().publish(nodes);
        }
        reachable
    }

    /// Polls on the interval until the node is disposed.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let node = self.host.node().clone();
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(peers = self.peers.len(), interval_secs = self.interval.as_secs(), "peer discovery started");
            loop {
                tokio::select! {
                    _ = node.disposed() => break,
                    _ = ticker.tick() => {
                        self.poll_once().await;
                    }
                }
            }
            tracing::debug!("peer discovery stopped");
        })
    }
}
