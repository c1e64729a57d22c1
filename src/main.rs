use anyhow::Result;
use forge_orchestrator::api::ApiServer;
use forge_orchestrator::config::Config;
use forge_orchestrator::coordination::{DiscoveryService, HealthMonitor, Router};
use forge_orchestrator::executor::Executor;
use forge_orchestrator::monitoring::{MonitoringConfig, SystemMonitor};
use forge_orchestrator::store::Store;
use forge_orchestrator::streaming::StreamingGateway;
use forge_orchestrator::tdd::TddEngine;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    info!("starting forge-orchestrator");

    let config = Config::load()?;

    let store = Arc::new(Store::new());
    let router = Arc::new(Router::new(Arc::clone(&store), &config.coordination));
    let health = Arc::new(HealthMonitor::new(Arc::clone(&store), config.coordination.clone()));
    let discovery = Arc::new(DiscoveryService::new(Arc::clone(&store)));
    let tdd = Arc::new(TddEngine::new(Arc::clone(&store), config.tdd.clone()));
    let executor = Arc::new(Executor::new(
        Arc::clone(&store),
        Arc::clone(&router),
        Arc::clone(&health),
        Arc::clone(&tdd),
        config.tdd.clone(),
    ));
    let streaming = Arc::new(StreamingGateway::new(
        Arc::clone(&store),
        config.api.subscriber_queue_capacity,
    ));

    let system_monitor = Arc::new(SystemMonitor::new(MonitoringConfig::default()));
    system_monitor.start_monitoring().await?;

    let api_server = ApiServer::new(
        config.clone(),
        Arc::clone(&store),
        Arc::clone(&executor),
        Arc::clone(&discovery),
        Arc::clone(&router),
        Arc::clone(&streaming),
    )?
    .with_system_monitor(Arc::clone(&system_monitor));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let health_loop = {
        let health = Arc::clone(&health);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { health.run_loop(shutdown_rx).await })
    };

    let discovery_cleanup_loop = {
        let discovery = Arc::clone(&discovery);
        let agent_timeout = config.coordination.agent_timeout;
        let cleanup_interval = config.coordination.cleanup_interval;
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            discovery.cleanup_loop(agent_timeout, cleanup_interval, shutdown_rx).await
        })
    };

    let discovery_scan_loop = {
        let discovery = Arc::clone(&discovery);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut last_seen = 0u64;
            discovery.scan_loop(&mut last_seen, shutdown_rx).await
        })
    };

    tokio::select! {
        result = api_server.run() => {
            if let Err(e) = result {
                error!("API server failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(health_loop, discovery_cleanup_loop, discovery_scan_loop);
    system_monitor.shutdown().await;

    Ok(())
}
