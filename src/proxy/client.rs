//! Client side: turns an ordinary HTTP request into a wire request, sends
//! it through the fabric, and rebuilds an ordinary HTTP response.

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;

use crate::proxy::error::{ProxyError, Result};
use crate::proxy::fabric::MessagingFabric;
use crate::proxy::pool::ProxyPool;
use crate::proxy::quota::BucketOptions;
use crate::proxy::selector::{AcquireResult, QuotaSelector};
use crate::proxy::trust::{HTTP_PROXY_METHOD, IP_TAG};
use crate::proxy::wire::{Credentials, HttpMethod, RedirectMode, WireRequest, WireResponse};

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub method: HttpMethod,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub credentials: Option<Credentials>,
    pub redirect: Option<RedirectMode>,
    pub referrer_policy: Option<String>,
    pub timeout: Option<Duration>,
    /// Routing labels; unset keys match any forwarder
    pub labels: HashMap<String, String>,
}

impl FetchOptions {
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn into_wire(self, url: String) -> WireRequest {
        WireRequest {
            url,
            method: self.method,
            headers: self.headers,
            body: self.body,
            credentials: self.credentials,
            redirect: self.redirect,
            referrer_policy: self.referrer_policy,
            timeout: self.timeout.map(|t| t.as_millis() as u64),
            labels: self.labels,
        }
    }
}

/// Quota to reserve before a request is sent
#[derive(Debug, Clone)]
pub struct QuotaRequest {
    pub base_key: String,
    pub weight: u64,
    pub bucket_options: BucketOptions,
}

/// Response rebuilt from the wire. The final URL is read-only.
#[derive(Debug, Clone)]
pub struct ProxiedResponse {
    status: StatusCode,
    status_text: String,
    headers: HeaderMap,
    body: Bytes,
    url: String,
}

impl ProxiedResponse {
    pub fn from_wire(wire: WireResponse) -> Result<Self> {
        let status = StatusCode::from_u16(wire.status).map_err(|_| ProxyError::Remote {
            code: 0,
            message: format!("forwarder returned invalid status {}", wire.status),
        })?;
        let mut headers = HeaderMap::with_capacity(wire.headers.len());
        for (name, value) in &wire.headers {
            let parsed = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            );
            match parsed {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => tracing::debug!(header = %name, "dropping unrepresentable response header"),
            }
        }
        Ok(Self {
            status,
            status_text: wire.status_text,
            headers,
            body: Bytes::from(wire.body),
            url: wire.url,
        })
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// URL the response was finally served from, after redirects
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn into_http(self) -> http::Response<Bytes> {
        let mut response = http::Response::new(self.body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Sends a wire request through the fabric.
pub async fn send_wire(fabric: &dyn MessagingFabric, request: WireRequest) -> Result<ProxiedResponse> {
    let payload = serde_json::to_value(&request).map_err(|e| ProxyError::InvalidUrl {
        url: request.url.clone(),
        reason: format!("unencodable request: {}", e),
    })?;
    let data = fabric.request(HTTP_PROXY_METHOD, payload).await.into_result()?;
    let wire: WireResponse = serde_json::from_value(data).map_err(|e| ProxyError::Remote {
        code: 0,
        message: format!("malformed forwarder response: {}", e),
    })?;
    ProxiedResponse::from_wire(wire)
}

pub async fn fetch(
    fabric: &dyn MessagingFabric,
    url: &str,
    options: FetchOptions,
) -> Result<ProxiedResponse> {
    send_wire(fabric, options.into_wire(url.to_string())).await
}

/// Sends an `http::Request`. Method, headers and body come from the
/// request; `options` supplies labels, timeout and fetch modes.
pub async fn fetch_request(
    fabric: &dyn MessagingFabric,
    request: http::Request<String>,
    mut options: FetchOptions,
) -> Result<ProxiedResponse> {
    let url = request.uri().to_string();
    options.method = HttpMethod::try_from(request.method()).map_err(|reason| {
        ProxyError::InvalidUrl {
            url: url.clone(),
            reason,
        }
    })?;
    let mut headers: HashMap<String, String> = HashMap::new();
    for (name, value) in request.headers() {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        headers
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    options.headers = headers;
    let body = request.into_body();
    options.body = if body.is_empty() { None } else { Some(body) };
    fetch(fabric, &url, options).await
}

/// Reserves quota on a trusted proxy first, then routes the request to
/// that proxy's egress IP.
pub async fn fetch_with_quota(
    fabric: &dyn MessagingFabric,
    selector: &QuotaSelector,
    pool: &ProxyPool,
    quota: &QuotaRequest,
    url: &str,
    options: FetchOptions,
) -> Result<(AcquireResult, ProxiedResponse)> {
    let acquired = selector.acquire(&quota.base_key, quota.weight, pool, || {
        quota.bucket_options.clone()
    })?;
    let options = options.label(IP_TAG, acquired.ip.clone());
    let response = fetch(fabric, url, options).await?;
    Ok((acquired, response))
}
