use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::proxy::ip_inject::{IpInjectOptions, DEFAULT_IP_FETCH_URL};
use crate::proxy::upstream::ForwarderOptions;

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stable identifier of this node on the fabric
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Listen address
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Base URL peers use to reach this node. Defaults to `http://bind:port`.
    #[serde(default)]
    pub public_url: Option<String>,

    /// Whether this node serves `HTTPProxy`
    #[serde(default = "default_true")]
    pub serve_proxy: bool,

    /// Routing labels advertised with the proxy service
    #[serde(default)]
    pub labels: HashMap<String, String>,

    #[serde(default)]
    pub forwarder: ForwarderOptions,

    /// Base URLs of other nodes
    #[serde(default)]
    pub peers: Vec<String>,

    #[serde(default = "default_discovery_interval_secs")]
    pub discovery_interval_secs: u64,

    /// Explicit egress IP; skips the public IP lookup
    #[serde(default)]
    pub proxy_ip: Option<String>,

    /// https URL answering with this host's public IP
    #[serde(default = "default_ip_fetch_url")]
    pub ip_fetch_url: String,
}

fn default_node_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("relay-{}", &id[..8])
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8390
}

fn default_true() -> bool {
    true
}

fn default_discovery_interval_secs() -> u64 {
    5
}

fn default_ip_fetch_url() -> String {
    DEFAULT_IP_FETCH_URL.to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            bind: default_bind(),
            port: default_port(),
            public_url: None,
            serve_proxy: true,
            labels: HashMap::new(),
            forwarder: ForwarderOptions::default(),
            peers: Vec::new(),
            discovery_interval_secs: default_discovery_interval_secs(),
            proxy_ip: None,
            ip_fetch_url: default_ip_fetch_url(),
        }
    }
}

impl NodeConfig {
    pub fn endpoint(&self) -> String {
        match &self.public_url {
            Some(url) if !url.trim().is_empty() => url.trim().trim_end_matches('/').to_string(),
            _ => format!("http://{}:{}", self.bind, self.port),
        }
    }

    pub fn ip_inject_options(&self) -> IpInjectOptions {
        IpInjectOptions {
            proxy_ip: self.proxy_ip.clone(),
            fetch_url: Some(self.ip_fetch_url.clone()),
        }
    }

    /// Applies environment overrides from the process environment.
    /// Returns a message per ignored value.
    pub fn apply_env_overrides(&mut self) -> Vec<String> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut ignored = Vec::new();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(node_id) = get("HTTP_RELAY_NODE_ID") {
            self.node_id = node_id;
        }
        if let Some(bind) = get("HTTP_RELAY_BIND") {
            self.bind = bind;
        }
        if let Some(port) = get("HTTP_RELAY_PORT") {
            match port.parse() {
                Ok(port) => self.port = port,
                Err(_) => ignored.push(format!("ignoring invalid HTTP_RELAY_PORT={}", port)),
            }
        }
        if let Some(url) = get("HTTP_RELAY_PUBLIC_URL") {
            self.public_url = Some(url);
        }
        if let Some(value) = get("HTTP_RELAY_SERVE_PROXY") {
            self.serve_proxy = matches!(value.as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(peers) = get("HTTP_RELAY_PEERS") {
            self.peers = split_list(&peers);
        }
        if let Some(ip) = get("PROXY_IP") {
            self.proxy_ip = Some(ip);
        }
        if let Some(url) = get("PROXY_IP_FETCH_URL") {
            self.ip_fetch_url = url;
        }
        if let Some(hosts) = get("HTTP_RELAY_ALLOWED_HOSTS") {
            self.forwarder.allowed_hosts = split_list(&hosts);
        }
        ignored
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
