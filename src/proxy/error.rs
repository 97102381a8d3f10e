//! Error types for the gateway core.
//!
//! Every failure that crosses a component boundary carries a stable,
//! string-coded identifier (`code()`) and a coarse class (`class()`).
//! `Display` renders as `CODE: context` so the code can be recovered from
//! a message that travelled over the fabric.

use thiserror::Error;

use crate::proxy::quota::QuotaError;

/// Coarse error classes used for metrics labels and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Malformed input (bad URL, bad wire payload)
    Validation,
    /// Containment failures: host not allow-listed, response too large
    Security,
    /// Deadline exceeded
    Timeout,
    /// Transport failure other than timeout
    Network,
    /// No trusted candidate, or every candidate exhausted
    Capacity,
    /// Inconsistent bucket options
    Configuration,
    /// Unexpected failure from a collaborator
    Internal,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Security => "security",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Network => "network",
            ErrorClass::Capacity => "capacity",
            ErrorClass::Configuration => "configuration",
            ErrorClass::Internal => "internal",
            ErrorClass::Unknown => "unknown",
        }
    }

    /// Class of a bare error code, as recovered from a remote message.
    pub fn from_code(code: &str) -> Self {
        match code {
            "INVALID_URL" => ErrorClass::Validation,
            "FORBIDDEN" | "RESPONSE_TOO_LARGE" => ErrorClass::Security,
            "TIMEOUT" => ErrorClass::Timeout,
            "FETCH_FAILED" | "E_FABRIC_TRANSPORT" => ErrorClass::Network,
            "E_PROXY_TARGET_NOT_FOUND" | "E_PROXY_BUCKET_EXHAUSTED" | "E_SERVICE_NOT_FOUND" => {
                ErrorClass::Capacity
            }
            "E_BUCKET_OPTIONS_CONFLICT" => ErrorClass::Configuration,
            "E_PROXY_ACQUIRE_INTERNAL_ERROR" => ErrorClass::Internal,
            _ => ErrorClass::Unknown,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("INVALID_URL: url={url} reason={reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("FORBIDDEN: host={host} is not in allowed hosts {allowed_hosts:?}")]
    Forbidden {
        host: String,
        allowed_hosts: Vec<String>,
    },

    #[error("TIMEOUT: url={url} timeout_ms={timeout_ms}")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("FETCH_FAILED: url={url} reason={reason}")]
    FetchFailed { url: String, reason: String },

    #[error("RESPONSE_TOO_LARGE: url={url} limit={limit} content_length={content_length:?}")]
    ResponseTooLarge {
        url: String,
        limit: u64,
        content_length: Option<u64>,
    },

    #[error("E_PROXY_TARGET_NOT_FOUND: reason={reason} node_id={node_id} base_key={base_key:?} timeout_ms={timeout_ms:?}")]
    TargetNotFound {
        reason: &'static str,
        node_id: String,
        base_key: Option<String>,
        timeout_ms: Option<u64>,
    },

    #[error("E_PROXY_BUCKET_EXHAUSTED: base_key={base_key} weight={weight} candidate_count={candidate_count}")]
    BucketExhausted {
        base_key: String,
        weight: u64,
        candidate_count: usize,
        #[source]
        last_error: Option<QuotaError>,
    },

    #[error("E_BUCKET_OPTIONS_CONFLICT: base_key={base_key} bucket_key={bucket_key}")]
    BucketOptionsConflict { base_key: String, bucket_key: String },

    #[error("E_PROXY_ACQUIRE_INTERNAL_ERROR: base_key={base_key} bucket_key={bucket_key} node_id={node_id} ip={ip} weight={weight}")]
    AcquireInternal {
        base_key: String,
        bucket_key: String,
        node_id: String,
        ip: String,
        weight: u64,
        #[source]
        source: QuotaError,
    },

    #[error("E_SERVICE_NOT_FOUND: no node serves method={method} for this request")]
    ServiceNotFound { method: String },

    #[error("E_FABRIC_TRANSPORT: target={target} reason={reason}")]
    FabricTransport { target: String, reason: String },

    /// A non-zero response code (or a missing payload) from the fabric.
    #[error("{message}")]
    Remote { code: i32, message: String },
}

impl ProxyError {
    /// Stable string identifier surfaced across the boundary.
    pub fn code(&self) -> &str {
        match self {
            ProxyError::InvalidUrl { .. } => "INVALID_URL",
            ProxyError::Forbidden { .. } => "FORBIDDEN",
            ProxyError::Timeout { .. } => "TIMEOUT",
            ProxyError::FetchFailed { .. } => "FETCH_FAILED",
            ProxyError::ResponseTooLarge { .. } => "RESPONSE_TOO_LARGE",
            ProxyError::TargetNotFound { .. } => "E_PROXY_TARGET_NOT_FOUND",
            ProxyError::BucketExhausted { .. } => "E_PROXY_BUCKET_EXHAUSTED",
            ProxyError::BucketOptionsConflict { .. } => "E_BUCKET_OPTIONS_CONFLICT",
            ProxyError::AcquireInternal { .. } => "E_PROXY_ACQUIRE_INTERNAL_ERROR",
            ProxyError::ServiceNotFound { .. } => "E_SERVICE_NOT_FOUND",
            ProxyError::FabricTransport { .. } => "E_FABRIC_TRANSPORT",
            ProxyError::Remote { message, .. } => remote_code(message),
        }
    }

    pub fn class(&self) -> ErrorClass {
        ErrorClass::from_code(self.code())
    }

    /// Capacity and timeout failures may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self.class(), ErrorClass::Capacity | ErrorClass::Timeout)
    }
}

/// Extracts the `CODE` prefix from a `CODE: context` message.
fn remote_code(message: &str) -> &str {
    match message.split_once(':') {
        Some((code, _)) if !code.is_empty() && !code.contains(' ') => code,
        _ => "E_REMOTE",
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
