// proxy module - label-routed HTTP forwarding over the node fabric

// Peer directory and proxy selection
pub mod directory;
pub mod trust;
pub mod pool;
pub mod quota;
pub mod bucket_options;
pub mod selector;

// Forwarding
pub mod wire;
pub mod schema;
pub mod upstream;          // Outbound HTTP forwarder
pub mod metrics;
pub mod service;
pub mod ip_inject;

// Fabric transports and node surface
pub mod fabric;
pub mod remote;
pub mod discovery;
pub mod server;
pub mod client;

pub mod config;
pub mod error;
pub mod path;

pub use client::{fetch, fetch_request, fetch_with_quota, FetchOptions, ProxiedResponse, QuotaRequest};
pub use config::NodeConfig;
pub use directory::{InMemoryDirectory, NodeHandle, NodeInfo, PeerDirectory};
pub use error::{ErrorClass, ProxyError};
pub use fabric::{LocalFabric, MessagingFabric, ServiceHost};
pub use pool::ProxyPool;
pub use remote::RemoteFabric;
pub use selector::{AcquireResult, QuotaSelector};
pub use server::{AppState, NodeServer};
pub use service::provide_http_proxy_service;
pub use trust::TrustedNodeIds;
pub use upstream::{ForwarderOptions, HttpForwarder};
