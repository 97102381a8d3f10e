use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use prometheus::{Encoder, Registry, TextEncoder};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::proxy::directory::NodeInfo;
use crate::proxy::fabric::{FabricResponse, ServiceHost};

const MAX_REQUEST_BODY: usize = 16 * 1024 * 1024;

/// Axum application state
#[derive(Clone)]
pub struct AppState {
    pub host: Arc<ServiceHost>,
    pub registry: Registry,
}

/// HTTP face of a node: service dispatch, node info and metrics.
pub struct NodeServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    local_addr: SocketAddr,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/services/:method", post(handle_service_request))
        .route("/api/node", get(handle_node_info))
        .route("/metrics", get(handle_metrics))
        .route("/healthz", get(health_check_handler))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

impl NodeServer {
    /// Binds `host:port` and serves until [`stop`](Self::stop) is called.
    pub async fn start(
        host: &str,
        port: u16,
        state: AppState,
    ) -> Result<(Self, tokio::task::JoinHandle<()>), String> {
        let app = router(state);

        let addr = format!("{}:{}", host, port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| format!("Failed to bind address {}: {}", addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| format!("Failed to read bound address: {}", e))?;

        tracing::info!("Node server started at http://{}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            use hyper::server::conn::http1;
            use hyper_util::rt::TokioIo;
            use hyper_util::service::TowerToHyperService;

            loop {
                tokio::select! {
                    res = listener.accept() => {
                        match res {
                            Ok((stream, _)) => {
                                let io = TokioIo::new(stream);
                                let service = TowerToHyperService::new(app.clone());

                                tokio::task::spawn(async move {
                                    if let Err(err) = http1::Builder::new()
                                        .serve_connection(io, service)
                                        .await
                                    {
                                        debug!("Connection handling ended or error: {:?}", err);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {:?}", e);
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        tracing::info!("Node server stopped listening");
                        break;
                    }
                }
            }
        });

        Ok((
            Self {
                shutdown_tx: Some(shutdown_tx),
                local_addr,
            },
            handle,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the server
    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn handle_service_request(
    State(state): State<AppState>,
    Path(method): Path<String>,
    Json(payload): Json<Value>,
) -> Json<FabricResponse> {
    Json(state.host.dispatch(&method, payload).await)
}

async fn handle_node_info(State(state): State<AppState>) -> Json<NodeInfo> {
    Json(state.host.node_info())
}

async fn handle_metrics(State(state): State<AppState>) -> Response {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&state.registry.gather(), &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buffer,
    )
        .into_response()
}

/// Health check handler
async fn health_check_handler() -> Response {
    Json(serde_json::json!({
        "status": "ok"
    }))
    .into_response()
}
