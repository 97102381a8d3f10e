use std::sync::Arc;
use std::time::Duration;

use http_relay::modules;
use http_relay::proxy;
use http_relay::proxy::ip_inject::compute_and_inject_proxy_ip;
use http_relay::proxy::metrics::ForwarderMetrics;
use http_relay::proxy::remote::ENDPOINT_TAG;
use http_relay::proxy::trust::IP_TAG;

#[tokio::main]
async fn main() -> Result<(), String> {
    // the log file is named after the node, so config comes first
    let (mut config, load_error) = match modules::config::load_node_config() {
        Ok(cfg) => (cfg, None),
        Err(err) => (proxy::NodeConfig::default(), Some(err)),
    };
    let ignored = config.apply_env_overrides();

    modules::logger::init_logger(&config.node_id);

    if let Some(err) = load_error {
        tracing::warn!("failed to load node config: {}. using defaults", err);
        let _ = modules::config::save_node_config(&config);
    }
    for message in ignored {
        tracing::warn!("{}", message);
    }

    let node = proxy::NodeHandle::new(config.node_id.clone());
    let directory = Arc::new(proxy::InMemoryDirectory::new());
    let host = proxy::ServiceHost::new(node.clone(), directory);
    host.set_tags([(ENDPOINT_TAG, config.endpoint())]);

    let registry = prometheus::Registry::new();

    let _registration = if config.serve_proxy {
        let mut labels = config.labels.clone();
        if let Some(ip) = compute_and_inject_proxy_ip(&host, &config.ip_inject_options()).await {
            labels.insert(IP_TAG.to_string(), ip);
        }

        let metrics = ForwarderMetrics::with_registry(registry.clone())
            .map_err(|e| format!("failed to register forwarder metrics: {}", e))?;
        let forwarder = Arc::new(proxy::HttpForwarder::new(config.forwarder.clone(), metrics)?);
        Some(proxy::provide_http_proxy_service(&host, labels, forwarder))
    } else {
        None
    };

    let _discovery = if config.peers.is_empty() {
        None
    } else {
        let poller = proxy::discovery::DiscoveryPoller::new(
            host.clone(),
            config.peers.clone(),
            Duration::from_secs(config.discovery_interval_secs.max(1)),
        )?;
        Some(poller.spawn())
    };

    let (server, handle) = proxy::NodeServer::start(
        &config.bind,
        config.port,
        proxy::AppState {
            host: host.clone(),
            registry,
        },
    )
    .await
    .map_err(|e| format!("failed to start node server: {}", e))?;

    tracing::info!(
        node_id = %config.node_id,
        "http-relay listening on {}",
        config.endpoint()
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("failed to listen for shutdown signal: {}", e))?;

    tracing::info!("shutdown requested, stopping node...");
    node.dispose();
    host.withdraw();
    server.stop();
    let _ = handle.await;

    Ok(())
}
