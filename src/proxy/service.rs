//! Advertising a forwarder on the fabric.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::proxy::error::{ProxyError, Result};
use crate::proxy::fabric::{ServiceHandler, ServiceHost};
use crate::proxy::schema::build_http_proxy_schema;
use crate::proxy::trust::HTTP_PROXY_METHOD;
use crate::proxy::upstream::HttpForwarder;
use crate::proxy::wire::WireRequest;

struct HttpProxyHandler {
    forwarder: Arc<HttpForwarder>,
}

#[async_trait]
impl ServiceHandler for HttpProxyHandler {
    async fn handle(&self, payload: Value) -> Result<Value> {
        let url_hint = payload
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let request: WireRequest =
            serde_json::from_value(payload).map_err(|e| ProxyError::InvalidUrl {
                url: url_hint,
                reason: format!("malformed request: {}", e),
            })?;
        let response = self.forwarder.forward(request).await?;
        serde_json::to_value(response).map_err(|e| ProxyError::FetchFailed {
            url: String::new(),
            reason: format!("encode response: {}", e),
        })
    }
}

/// A forwarder advertised under `HTTPProxy`. Withdrawn by
/// [`dispose`](Self::dispose) or when the node is disposed.
pub struct ServiceRegistration {
    host: Arc<ServiceHost>,
    forwarder: Arc<HttpForwarder>,
}

impl ServiceRegistration {
    pub fn forwarder(&self) -> &Arc<HttpForwarder> {
        &self.forwarder
    }

    pub fn dispose(&self) {
        self.host.unregister(HTTP_PROXY_METHOD);
    }
}

/// Merges `labels` into the node tags and serves `HTTPProxy` with
/// `forwarder`, advertising a schema pinned to those labels.
pub fn provide_http_proxy_service(
    host: &Arc<ServiceHost>,
    labels: HashMap<String, String>,
    forwarder: Arc<HttpForwarder>,
) -> ServiceRegistration {
    host.set_tags(labels.clone());
    let schema = build_http_proxy_schema(&labels);
    host.register(
        HTTP_PROXY_METHOD,
        schema,
        Arc::new(HttpProxyHandler {
            forwarder: forwarder.clone(),
        }),
    );

    let watched = host.clone();
    let node = host.node().clone();
    tokio::spawn(async move {
        node.disposed().await;
        watched.unregister(HTTP_PROXY_METHOD);
    });

    ServiceRegistration {
        host: host.clone(),
        forwarder,
    }
}
