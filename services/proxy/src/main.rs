//! relaygate
//!
//! HTTP CONNECT proxy with health-checked backend groups.
//!
//! This service:
//! - Binds a CONNECT listener on the configured interface
//! - Hands accepted connections from acceptor reactors to worker reactors
//! - Follows an HTTP discovery endpoint and health-checks every backend
//! - Tunnels each CONNECT to a healthy backend of the matching service, or
//!   dials the target directly when no discovery endpoint is configured

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relaygate_proxy::backend::{Discovery, HttpDiscovery, StaticDiscovery};
use relaygate_proxy::config::Config;
use relaygate_proxy::net::{BindServer, EventLoopGroup};
use relaygate_proxy::proxy::{ConnectProxy, DirectConnectorProvider, ProxyOptions};
use relaygate_proxy::AutoConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to RELAYGATE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting relaygate");
    info!(
        nic = %config.nic,
        ip_type = %config.ip_type,
        port = config.port,
        method = %config.method,
        health_check = %config.health_check.protocol,
        discovery_url = ?config.discovery_url,
        "Configuration loaded"
    );

    let acceptor = Arc::new(
        EventLoopGroup::new("acceptor", config.acceptor_threads)
            .context("Failed to start acceptor event loops")?,
    );
    let worker = Arc::new(
        EventLoopGroup::new("worker", config.worker_threads)
            .context("Failed to start worker event loops")?,
    );

    let http_discovery = match &config.discovery_url {
        Some(url) => Some(Arc::new(
            HttpDiscovery::start(url.as_str(), config.discovery_poll_interval)
                .context("Failed to start discovery")?,
        )),
        None => None,
    };
    let discovery: Arc<dyn Discovery> = match &http_discovery {
        Some(discovery) => Arc::clone(discovery) as Arc<dyn Discovery>,
        None => Arc::new(StaticDiscovery::new(Vec::new())),
    };

    let auto = AutoConfig::new(
        Arc::clone(&acceptor),
        Arc::clone(&worker),
        discovery,
        config.nic.clone(),
        config.ip_type,
        config.health_check.clone(),
        config.method,
    )
    .context("Failed to resolve bind address")?;

    let options = ProxyOptions {
        idle_timeout: config.idle_timeout,
    };
    let groups = auto.start_groups().await?;

    let proxy = if http_discovery.is_some() {
        auto.start_proxy(config.port, Arc::clone(&groups), config.connect_timeout, options)
    } else {
        info!("No discovery endpoint configured; dialing CONNECT targets directly");
        BindServer::create(auto.bind_addr(config.port)).and_then(|server| {
            ConnectProxy::start(
                auto.acceptor(),
                Arc::clone(auto.worker()),
                Arc::new(server),
                Arc::new(DirectConnectorProvider::new(config.connect_timeout)),
                options,
            )
        })
    }
    .with_context(|| format!("Failed to start proxy on {}", auto.bind_addr(config.port)))?;

    info!(bind_addr = %proxy.local_addr(), "relaygate ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");

    proxy.close();
    groups.close().await;
    if let Some(discovery) = &http_discovery {
        discovery.close();
    }
    // Joining reactor threads blocks.
    tokio::task::spawn_blocking(move || {
        acceptor.close();
        worker.close();
    })
    .await
    .context("Failed to stop event loops")?;

    Ok(())
}
