//! Request and response shapes exchanged between clients and forwarders.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    pub const ALL: [HttpMethod; 7] = [
        HttpMethod::Get,
        HttpMethod::Post,
        HttpMethod::Put,
        HttpMethod::Delete,
        HttpMethod::Patch,
        HttpMethod::Head,
        HttpMethod::Options,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<HttpMethod> for http::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => http::Method::GET,
            HttpMethod::Post => http::Method::POST,
            HttpMethod::Put => http::Method::PUT,
            HttpMethod::Delete => http::Method::DELETE,
            HttpMethod::Patch => http::Method::PATCH,
            HttpMethod::Head => http::Method::HEAD,
            HttpMethod::Options => http::Method::OPTIONS,
        }
    }
}

impl TryFrom<&http::Method> for HttpMethod {
    type Error = String;

    fn try_from(method: &http::Method) -> Result<Self, Self::Error> {
        HttpMethod::ALL
            .into_iter()
            .find(|m| m.as_str() == method.as_str())
            .ok_or_else(|| format!("unsupported method {}", method))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Credentials {
    Omit,
    SameOrigin,
    Include,
}

impl Credentials {
    pub fn as_str(&self) -> &'static str {
        match self {
            Credentials::Omit => "omit",
            Credentials::SameOrigin => "same-origin",
            Credentials::Include => "include",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedirectMode {
    #[default]
    Follow,
    Error,
    Manual,
}

impl RedirectMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedirectMode::Follow => "follow",
            RedirectMode::Error => "error",
            RedirectMode::Manual => "manual",
        }
    }
}

/// Client to forwarder. `labels` only steer routing and never reach the
/// origin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireRequest {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<RedirectMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer_policy: Option<String>,
    /// Milliseconds
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_millis"
    )]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

impl WireRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Per-request deadline. Zero counts as unset.
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.filter(|&ms| ms > 0).map(Duration::from_millis)
    }

    pub fn redirect_mode(&self) -> RedirectMode {
        self.redirect.unwrap_or_default()
    }
}

/// Accepts any non-negative JSON number; fractions are truncated.
fn deserialize_millis<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<serde_json::Number> = Option::deserialize(deserializer)?;
    match value {
        None => Ok(None),
        Some(n) => {
            if let Some(ms) = n.as_u64() {
                return Ok(Some(ms));
            }
            match n.as_f64() {
                Some(ms) if ms >= 0.0 && ms.is_finite() => Ok(Some(ms as u64)),
                _ => Err(serde::de::Error::custom(format!(
                    "timeout must be a non-negative number of milliseconds, got {}",
                    n
                ))),
            }
        }
    }
}

/// Forwarder to client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireResponse {
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
    pub ok: bool,
    /// Final URL after redirects
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_minimal_request_defaults() {
        let req: WireRequest = serde_json::from_value(json!({ "url": "https://a.example/x" })).unwrap();
        assert_eq!(req.method, HttpMethod::Get);
        assert_eq!(req.redirect_mode(), RedirectMode::Follow);
        assert!(req.headers.is_empty());
        assert!(req.timeout.is_none());
    }

    #[test]
    fn test_zero_timeout_is_unset() {
        let mut req = WireRequest::get("https://a.example/");
        req.timeout = Some(0);
        assert_eq!(req.timeout_duration(), None);
        req.timeout = Some(250);
        assert_eq!(req.timeout_duration(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_full_request_field_names() {
        let req: WireRequest = serde_json::from_value(json!({
            "url": "https://a.example/x",
            "method": "POST",
            "headers": { "content-type": "application/json" },
            "body": "{}",
            "credentials": "same-origin",
            "redirect": "manual",
            "referrerPolicy": "no-referrer",
            "timeout": 1500.7,
            "labels": { "region": "eu" }
        }))
        .unwrap();
        assert_eq!(req.method, HttpMethod::Post);
        assert_eq!(req.credentials, Some(Credentials::SameOrigin));
        assert_eq!(req.redirect, Some(RedirectMode::Manual));
        assert_eq!(req.referrer_policy.as_deref(), Some("no-referrer"));
        assert_eq!(req.timeout, Some(1500));
        assert_eq!(req.labels["region"], "eu");

        let back = serde_json::to_value(&req).unwrap();
        assert_eq!(back["referrerPolicy"], "no-referrer");
        assert_eq!(back["timeout"], 1500);
    }

    #[test]
    fn test_rejects_unknown_method_and_negative_timeout() {
        assert!(serde_json::from_value::<WireRequest>(json!({ "url": "u", "method": "TRACE" })).is_err());
        assert!(serde_json::from_value::<WireRequest>(json!({ "url": "u", "timeout": -1 })).is_err());
    }

    #[test]
    fn test_method_conversions() {
        assert_eq!(http::Method::from(HttpMethod::Patch), http::Method::PATCH);
        assert_eq!(HttpMethod::try_from(&http::Method::DELETE), Ok(HttpMethod::Delete));
        assert!(HttpMethod::try_from(&http::Method::TRACE).is_err());
    }

    #[test]
    fn test_response_uses_camel_case() {
        let resp = WireResponse {
            status: 404,
            status_text: "Not Found".into(),
            ok: false,
            url: "https://a.example/x".into(),
            ..Default::default()
        };
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["statusText"], "Not Found");
        assert_eq!(value["ok"], false);
    }
}
