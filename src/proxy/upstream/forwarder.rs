// Outbound side of a proxy node: executes one wire request against the
// origin with host containment, a deadline and a hard body ceiling.

use reqwest::{header, redirect, Client, Response};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::time::Duration;
use url::Url;

use crate::proxy::error::{ErrorClass, ProxyError, Result};
use crate::proxy::metrics::ForwarderMetrics;
use crate::proxy::wire::{HttpMethod, RedirectMode, WireRequest, WireResponse};

pub const DEFAULT_MAX_RESPONSE_BODY_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const MAX_REDIRECTS: usize = 10;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// A followed redirect pointed outside `allowed_hosts`.
#[derive(Debug, thiserror::Error)]
#[error("redirect to host {host} is not allowed")]
struct RedirectBlocked {
    host: String,
}

/// Forwarder limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwarderOptions {
    /// Hosts the forwarder may reach. Empty allows every host, which leaves
    /// internal addresses reachable through the proxy.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,

    #[serde(default = "default_max_response_body_size")]
    pub max_response_body_size: u64,

    /// Used when a request carries no `timeout`
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

fn default_max_response_body_size() -> u64 {
    DEFAULT_MAX_RESPONSE_BODY_SIZE
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl Default for ForwarderOptions {
    fn default() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            max_response_body_size: DEFAULT_MAX_RESPONSE_BODY_SIZE,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl ForwarderOptions {
    fn host_allowed(&self, host: &str) -> bool {
        host_in(&self.allowed_hosts, host)
    }
}

fn host_in(allowed_hosts: &[String], host: &str) -> bool {
    allowed_hosts.is_empty()
        || allowed_hosts
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(host))
}

/// Follows up to `MAX_REDIRECTS` hops, each of which must stay on an
/// allowed host.
fn follow_policy(allowed_hosts: Vec<String>) -> redirect::Policy {
    if allowed_hosts.is_empty() {
        return redirect::Policy::limited(MAX_REDIRECTS);
    }
    redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() > MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        let host = attempt.url().host_str().unwrap_or_default().to_string();
        if host_in(&allowed_hosts, &host) {
            attempt.follow()
        } else {
            attempt.error(RedirectBlocked { host })
        }
    })
}

pub struct HttpForwarder {
    following: Client,
    // Used for `redirect: manual` and `redirect: error`
    not_following: Client,
    options: ForwarderOptions,
    metrics: ForwarderMetrics,
}

impl HttpForwarder {
    pub fn new(options: ForwarderOptions, metrics: ForwarderMetrics) -> std::result::Result<Self, String> {
        if options.allowed_hosts.is_empty() {
            tracing::warn!("forwarder has no allowed_hosts, every destination is reachable");
        }
        let following = build_client(follow_policy(options.allowed_hosts.clone()))?;
        let not_following = build_client(redirect::Policy::none())?;
        Ok(Self {
            following,
            not_following,
            options,
            metrics,
        })
    }

    pub fn options(&self) -> &ForwarderOptions {
        &self.options
    }

    pub fn metrics(&self) -> &ForwarderMetrics {
        &self.metrics
    }

    /// Executes `request` and returns the origin's response.
    pub async fn forward(&self, request: WireRequest) -> Result<WireResponse> {
        let method = request.method;
        let guard = self.metrics.start(method.as_str());
        let outcome = self.execute(request).await;
        match &outcome {
            Ok(response) => {
                guard.succeeded(response.status);
                tracing::debug!(
                    method = method.as_str(),
                    url = %response.url,
                    status = response.status,
                    "request forwarded"
                );
            }
            Err(err) => {
                let class = forwarder_class(err);
                guard.failed(err.code(), class);
                tracing::warn!(
                    method = method.as_str(),
                    error_code = err.code(),
                    error_type = class.as_str(),
                    "forwarding failed: {}",
                    err
                );
            }
        }
        outcome
    }

    async fn execute(&self, request: WireRequest) -> Result<WireResponse> {
        let url = parse_target(&request.url)?;
        let host = url.host_str().unwrap_or_default().to_string();
        if !self.options.host_allowed(&host) {
            return Err(ProxyError::Forbidden {
                host,
                allowed_hosts: self.options.allowed_hosts.clone(),
            });
        }

        // a zero timeout means "use the default"
        let deadline = request
            .timeout_duration()
            .unwrap_or(Duration::from_millis(self.options.default_timeout_ms));
        let exchange = self.exchange(url, &request);
        match tokio::time::timeout(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::Timeout {
                url: request.url.clone(),
                timeout_ms: deadline.as_millis() as u64,
            }),
        }
    }

    async fn exchange(&self, url: Url, request: &WireRequest) -> Result<WireResponse> {
        let redirect_mode = request.redirect_mode();
        let client = match redirect_mode {
            RedirectMode::Follow => &self.following,
            RedirectMode::Manual | RedirectMode::Error => &self.not_following,
        };

        let mut builder = client.request(request.method.into(), url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(policy) = &request.referrer_policy {
            let already_set = request
                .headers
                .keys()
                .any(|k| k.eq_ignore_ascii_case(header::REFERRER_POLICY.as_str()));
            if !already_set {
                builder = builder.header(header::REFERRER_POLICY, policy.as_str());
            }
        }
        if let Some(body) = &request.body {
            if !matches!(request.method, HttpMethod::Get | HttpMethod::Head) {
                builder = builder.body(body.clone());
            }
        }

        let response = builder
            .send()
            .await
            .map_err(|e| self.send_error(&request.url, e))?;

        if redirect_mode == RedirectMode::Error && response.status().is_redirection() {
            return Err(ProxyError::FetchFailed {
                url: request.url.clone(),
                reason: format!("redirect ({}) not allowed", response.status()),
            });
        }

        self.read_response(response, &request.url).await
    }

    fn send_error(&self, url: &str, err: reqwest::Error) -> ProxyError {
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            if let Some(blocked) = cause.downcast_ref::<RedirectBlocked>() {
                return ProxyError::Forbidden {
                    host: blocked.host.clone(),
                    allowed_hosts: self.options.allowed_hosts.clone(),
                };
            }
            source = cause.source();
        }
        transport_error(url, err)
    }

    async fn read_response(&self, mut response: Response, request_url: &str) -> Result<WireResponse> {
        let limit = self.options.max_response_body_size;
        let too_large = |content_length: Option<u64>| ProxyError::ResponseTooLarge {
            url: request_url.to_string(),
            limit,
            content_length,
        };

        let declared = response.content_length();
        if let Some(length) = declared {
            if length > limit {
                return Err(too_large(declared));
            }
        }

        let status = response.status();
        let final_url = response.url().to_string();
        let headers = flatten_headers(response.headers());

        let mut body: Vec<u8> = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| transport_error(request_url, e))?
        {
            if body.len() as u64 + chunk.len() as u64 > limit {
                return Err(too_large(declared));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(WireResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
            ok: status.is_success(),
            url: final_url,
        })
    }
}

fn build_client(policy: redirect::Policy) -> std::result::Result<Client, String> {
    Client::builder()
        .redirect(policy)
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_max_idle_per_host(16)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .no_proxy()
        .build()
        .map_err(|e| format!("Failed to create HTTP client: {}", e))
}

fn parse_target(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| ProxyError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ProxyError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ProxyError::InvalidUrl {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(url)
}

fn transport_error(url: &str, err: reqwest::Error) -> ProxyError {
    if err.is_timeout() {
        // the request deadline is enforced above, so this is the connect timer
        return ProxyError::Timeout {
            url: url.to_string(),
            timeout_ms: CONNECT_TIMEOUT.as_millis() as u64,
        };
    }
    ProxyError::FetchFailed {
        url: url.to_string(),
        reason: err.to_string(),
    }
}

/// Repeated header values are joined with `", "`.
fn flatten_headers(headers: &header::HeaderMap) -> HashMap<String, String> {
    let mut flat: HashMap<String, String> = HashMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        flat.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    flat
}

/// Metric class of a forwarder failure.
fn forwarder_class(err: &ProxyError) -> ErrorClass {
    match err.class() {
        class @ (ErrorClass::Validation
        | ErrorClass::Security
        | ErrorClass::Timeout
        | ErrorClass::Network) => class,
        _ => ErrorClass::Unknown,
    }
}
