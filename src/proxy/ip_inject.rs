//! Egress IP self-report. This is the only path that writes the trusted
//! `ip_source` marker into a node's tags.

use reqwest::Client;
use std::time::Duration;
use url::Url;

use crate::proxy::fabric::ServiceHost;
use crate::proxy::trust::{normalize_ip, IP_SOURCE_TAG, IP_TAG, TRUSTED_PROXY_IP_SOURCE};

pub const DEFAULT_IP_FETCH_URL: &str = "https://ifconfig.me/ip";
const IP_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
pub struct IpInjectOptions {
    /// Explicit egress IP; used as-is when it is a valid literal
    pub proxy_ip: Option<String>,
    /// Where to look up the public IP otherwise. Must be https.
    pub fetch_url: Option<String>,
}

/// The URL if it parses and uses https.
pub fn normalize_https_url(value: &str) -> Option<Url> {
    Url::parse(value.trim()).ok().filter(|url| url.scheme() == "https")
}

/// Fetches the public IP as plain text from `url`.
pub async fn fetch_public_ip(url: &str) -> Result<String, String> {
    let url = normalize_https_url(url).ok_or_else(|| format!("ip fetch url must be https: {}", url))?;
    let client = Client::builder()
        .timeout(IP_FETCH_TIMEOUT)
        .build()
        .map_err(|e| format!("Failed to create HTTP client: {}", e))?;
    let text = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| format!("request to {} failed: {}", url, e))?
        .text()
        .await
        .map_err(|e| format!("reading {} failed: {}", url, e))?;
    normalize_ip(Some(&text)).ok_or_else(|| format!("{} returned no ip literal", url))
}

/// Determines this node's egress IP and tags the node with it and the
/// trusted provenance marker. Returns the IP now advertised, if any.
pub async fn compute_and_inject_proxy_ip(host: &ServiceHost, options: &IpInjectOptions) -> Option<String> {
    let tags = host.tags();
    let current = normalize_ip(tags.get(IP_TAG).map(String::as_str));

    let mut ip = normalize_ip(options.proxy_ip.as_deref());
    if ip.is_none() {
        let fetch_url = options.fetch_url.as_deref().unwrap_or(DEFAULT_IP_FETCH_URL);
        match fetch_public_ip(fetch_url).await {
            Ok(found) => ip = Some(found),
            Err(e) => tracing::warn!("failed to determine public ip: {}", e),
        }
    }

    let Some(ip) = ip else {
        tracing::info!(node_id = host.node().node_id(), "proxy ip is empty, skip inject");
        return current;
    };

    let changed = host.set_tags([
        (IP_TAG, ip.as_str()),
        (IP_SOURCE_TAG, TRUSTED_PROXY_IP_SOURCE),
    ]);
    if changed {
        tracing::info!(node_id = host.node().node_id(), ip = %ip, "proxy ip injected");
    }
    Some(ip)
}
