//! HTTP transport for the fabric: requests travel to the chosen node's
//! `POST /api/services/{method}` endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::proxy::directory::{NodeInfo, PeerDirectory};
use crate::proxy::error::ProxyError;
use crate::proxy::fabric::{pick_random, resolve_candidates, FabricResponse, MessagingFabric, ServiceHost};

/// Tag holding a node's base URL, e.g. `http://10.0.0.5:8390`
pub const ENDPOINT_TAG: &str = "endpoint";

pub fn service_url(endpoint: &str, method: &str) -> String {
    format!("{}/api/services/{}", endpoint.trim_end_matches('/'), method)
}

pub struct RemoteFabric {
    directory: Arc<dyn PeerDirectory>,
    local: Option<Arc<ServiceHost>>,
    client: Client,
}

impl RemoteFabric {
    /// `timeout` bounds one round trip; forwarders enforce their own
    /// deadline inside it.
    pub fn new(directory: Arc<dyn PeerDirectory>, timeout: Duration) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .no_proxy()
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {}", e))?;
        Ok(Self {
            directory,
            local: None,
            client,
        })
    }

    /// Requests resolved to this host are dispatched in-process.
    pub fn with_local(mut self, host: Arc<ServiceHost>) -> Self {
        self.local = Some(host);
        self
    }

    async fn send(&self, target: &NodeInfo, method: &str, payload: Value) -> FabricResponse {
        if let Some(local) = &self.local {
            if local.node().node_id() == target.node_id {
                return local.dispatch(method, payload).await;
            }
        }

        let transport = |reason: String| {
            FabricResponse::from_error(&ProxyError::FabricTransport {
                target: target.node_id.clone(),
                reason,
            })
        };
        let Some(endpoint) = target.tag(ENDPOINT_TAG) else {
            return transport("node advertises no endpoint".to_string());
        };
        let url = service_url(endpoint, method);
        let request_id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(node = %target.node_id, %url, %request_id, "fabric request");

        let response = match self
            .client
            .post(&url)
            .header("x-request-id", request_id.as_str())
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return transport(e.to_string()),
        };
        let status = response.status();
        if !status.is_success() {
            return transport(format!("{} answered {}", url, status));
        }
        match response.json::<FabricResponse>().await {
            Ok(body) => body,
            Err(e) => transport(format!("invalid response body: {}", e)),
        }
    }
}

#[async_trait]
impl MessagingFabric for RemoteFabric {
    async fn request(&self, method: &str, payload: Value) -> FabricResponse {
        let target = {
            let snapshot = self.directory.snapshot();
            let candidates = resolve_candidates(&snapshot, method, &payload);
            pick_random(&candidates).cloned()
        };
        match target {
            Some(target) => self.send(&target, method, payload).await,
            None => FabricResponse::from_error(&ProxyError::ServiceNotFound {
                method: method.to_string(),
            }),
        }
    }
}
