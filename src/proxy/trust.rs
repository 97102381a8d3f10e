//! Trust gates for proxy candidates.
//!
//! A candidate is trusted only if (a) its `ip_source` tag carries the
//! provenance marker written by the verified IP injection path and (b) its
//! node id is on the externally configured allow-list. An empty allow-list
//! trusts nobody.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;

use crate::proxy::directory::NodeInfo;

/// Fabric method served by proxy forwarders
pub const HTTP_PROXY_METHOD: &str = "HTTPProxy";

/// Provenance marker written by `compute_and_inject_proxy_ip`
pub const TRUSTED_PROXY_IP_SOURCE: &str = "http-services";

pub const IP_TAG: &str = "ip";
pub const IP_SOURCE_TAG: &str = "ip_source";

pub const TRUSTED_PROXY_NODE_IDS_ENV: &str = "TRUSTED_HTTP_PROXY_TERMINAL_IDS";

/// Allow-list of node ids permitted to act as proxies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustedNodeIds {
    ids: HashSet<String>,
}

impl TrustedNodeIds {
    /// Parses a comma-separated list, ignoring blanks.
    pub fn parse(raw: &str) -> Self {
        let ids = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Self { ids }
    }

    pub fn from_env() -> Self {
        let raw = std::env::var(TRUSTED_PROXY_NODE_IDS_ENV).unwrap_or_default();
        let trusted = Self::parse(&raw);
        if trusted.is_empty() {
            tracing::warn!(
                "{} is empty, every proxy node will be denied",
                TRUSTED_PROXY_NODE_IDS_ENV
            );
        }
        trusted
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.ids.contains(node_id)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }
}

impl<S: Into<String>> FromIterator<S> for TrustedNodeIds {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self {
            ids: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// Returns the trimmed IP literal, or `None` when absent or malformed.
pub fn normalize_ip(value: Option<&str>) -> Option<String> {
    let ip = value?.trim();
    ip.parse::<IpAddr>().ok().map(|_| ip.to_string())
}

pub fn is_http_proxy_node(info: &NodeInfo) -> bool {
    info.serves(HTTP_PROXY_METHOD)
}

/// A proxy node as seen by the selector. Only nodes that pass both trust
/// gates become candidates, so there is no separate `trusted` flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub node_id: String,
    pub ip: String,
}

/// Why a proxy node did not make it into the candidate list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NotAllowListed,
    MissingIp,
    UntrustedIpSource,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::NotAllowListed => "node not in trusted allow-list",
            Rejection::MissingIp => "missing or malformed ip tag",
            Rejection::UntrustedIpSource => "ip source not trusted",
        }
    }
}

/// Applies both trust gates to one proxy node.
pub fn evaluate(info: &NodeInfo, trusted: &TrustedNodeIds) -> Result<Candidate, Rejection> {
    if !trusted.contains(&info.node_id) {
        return Err(Rejection::NotAllowListed);
    }
    let ip = normalize_ip(info.tag(IP_TAG)).ok_or(Rejection::MissingIp)?;
    if info.tag(IP_SOURCE_TAG) != Some(TRUSTED_PROXY_IP_SOURCE) {
        return Err(Rejection::UntrustedIpSource);
    }
    Ok(Candidate {
        node_id: info.node_id.clone(),
        ip,
    })
}

/// Trusted candidates sorted by node id, one per egress IP.
pub fn trusted_candidates(nodes: &[NodeInfo], trusted: &TrustedNodeIds) -> Vec<Candidate> {
    trusted_candidates_with(nodes, trusted, |_, _| {})
}

/// Like [`trusted_candidates`], reporting each rejected proxy node.
pub fn trusted_candidates_with<F>(
    nodes: &[NodeInfo],
    trusted: &TrustedNodeIds,
    mut on_reject: F,
) -> Vec<Candidate>
where
    F: FnMut(&NodeInfo, Rejection),
{
    if trusted.is_empty() {
        return Vec::new();
    }
    let mut candidates: Vec<Candidate> = nodes
        .iter()
        .filter(|info| is_http_proxy_node(info))
        .filter_map(|info| match evaluate(info, trusted) {
            Ok(candidate) => Some(candidate),
            Err(rejection) => {
                on_reject(info, rejection);
                None
            }
        })
        .collect();
    candidates.sort_by(|a, b| a.node_id.cmp(&b.node_id));
    let mut seen = HashSet::new();
    candidates.retain(|c| seen.insert(c.ip.clone()));
    candidates
}

pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(3600);

/// Lets a message through at most once per window per key.
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last: HashMap<String, Instant>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: HashMap::new(),
        }
    }

    pub fn should_log(&mut self, key: &str) -> bool {
        let now = Instant::now();
        match self.last.get(key) {
            Some(at) if now.duration_since(*at) < self.interval => false,
            _ => {
                self.last.insert(key.to_string(), now);
                true
            }
        }
    }
}

impl Default for LogThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_INTERVAL)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::proxy::directory::ServiceInfo;

    pub(crate) fn proxy_node(node_id: &str, ip: &str, ip_source: &str) -> NodeInfo {
        let mut info = NodeInfo::new(node_id);
        info.tags.insert(IP_TAG.into(), ip.into());
        info.tags.insert(IP_SOURCE_TAG.into(), ip_source.into());
        info.service_info.insert(
            HTTP_PROXY_METHOD.into(),
            ServiceInfo {
                service_id: None,
                method: HTTP_PROXY_METHOD.into(),
                schema: serde_json::json!({ "type": "object" }),
            },
        );
        info
    }

    #[test]
    fn test_parse_allow_list() {
        let trusted = TrustedNodeIds::parse(" n1, ,n2,, ");
        assert_eq!(trusted.len(), 2);
        assert!(trusted.contains("n1"));
        assert!(trusted.contains("n2"));
        assert!(TrustedNodeIds::parse("").is_empty());
    }

    #[test]
    fn test_from_env_reads_allow_list() {
        std::env::set_var(TRUSTED_PROXY_NODE_IDS_ENV, "proxy-a, proxy-b");
        let trusted = TrustedNodeIds::from_env();
        assert_eq!(trusted.len(), 2);
        assert!(trusted.contains("proxy-a"));
        assert!(trusted.contains("proxy-b"));

        std::env::remove_var(TRUSTED_PROXY_NODE_IDS_ENV);
        let unset = TrustedNodeIds::from_env();
        assert!(unset.is_empty());
        let nodes = vec![proxy_node("proxy-a", "10.0.0.1", TRUSTED_PROXY_IP_SOURCE)];
        assert!(trusted_candidates(&nodes, &unset).is_empty());
    }

    #[test]
    fn test_normalize_ip() {
        assert_eq!(normalize_ip(Some(" 10.0.0.1 ")), Some("10.0.0.1".into()));
        assert_eq!(normalize_ip(Some("::1")), Some("::1".into()));
        assert_eq!(normalize_ip(Some("not-an-ip")), None);
        assert_eq!(normalize_ip(Some("")), None);
        assert_eq!(normalize_ip(None), None);
    }

    #[test]
    fn test_empty_allow_list_fails_closed() {
        let nodes = vec![
            proxy_node("n1", "10.0.0.1", TRUSTED_PROXY_IP_SOURCE),
            proxy_node("n2", "10.0.0.2", TRUSTED_PROXY_IP_SOURCE),
        ];
        assert!(trusted_candidates(&nodes, &TrustedNodeIds::default()).is_empty());
    }

    #[test]
    fn test_both_gates_required() {
        let trusted: TrustedNodeIds = ["n1", "n2", "n3"].into_iter().collect();
        let nodes = vec![
            proxy_node("n1", "10.0.0.1", TRUSTED_PROXY_IP_SOURCE),
            proxy_node("n2", "10.0.0.2", "self-reported"),
            proxy_node("n3", "garbage", TRUSTED_PROXY_IP_SOURCE),
            proxy_node("n4", "10.0.0.4", TRUSTED_PROXY_IP_SOURCE),
        ];
        let candidates = trusted_candidates(&nodes, &trusted);
        assert_eq!(
            candidates,
            vec![Candidate {
                node_id: "n1".into(),
                ip: "10.0.0.1".into()
            }]
        );
        assert_eq!(evaluate(&nodes[1], &trusted), Err(Rejection::UntrustedIpSource));
        assert_eq!(evaluate(&nodes[2], &trusted), Err(Rejection::MissingIp));
        assert_eq!(evaluate(&nodes[3], &trusted), Err(Rejection::NotAllowListed));
    }

    #[test]
    fn test_non_proxy_nodes_ignored() {
        let trusted: TrustedNodeIds = ["n1"].into_iter().collect();
        let mut plain = NodeInfo::new("n1");
        plain.tags.insert(IP_TAG.into(), "10.0.0.1".into());
        plain.tags.insert(IP_SOURCE_TAG.into(), TRUSTED_PROXY_IP_SOURCE.into());
        assert!(trusted_candidates(&[plain], &trusted).is_empty());
    }

    #[test]
    fn test_duplicate_ip_binds_to_trusted_node() {
        let trusted: TrustedNodeIds = ["trusted-proxy"].into_iter().collect();
        let nodes = vec![
            proxy_node("a-untrusted", "10.0.7.1", TRUSTED_PROXY_IP_SOURCE),
            proxy_node("trusted-proxy", "10.0.7.1", TRUSTED_PROXY_IP_SOURCE),
        ];
        let candidates = trusted_candidates(&nodes, &trusted);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].node_id, "trusted-proxy");
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_throttle_window() {
        let mut throttle = LogThrottle::new(Duration::from_secs(60));
        assert!(throttle.should_log("n1"));
        assert!(!throttle.should_log("n1"));
        assert!(throttle.should_log("n2"));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(throttle.should_log("n1"));
    }
}
