//! K8s Metrics API - cluster inventory metrics service
//!
//! Lists nodes, pods, namespaces, deployments and services from the
//! Kubernetes API on demand and serves the aggregate as JSON and as
//! Prometheus gauges.

use anyhow::Result;
use metrics_api::{api, ApiConfig, AppState};
use metrics_lib::{
    health::{components, HealthRegistry},
    Aggregator, GaugeSet, KubeClusterReader, MetricRegistry, PollMetrics, StructuredLogger,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// `RUST_LOG` wins over the configured level
fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

async fn shutdown_signal(logger: StructuredLogger) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    logger.log_shutdown("SIGINT received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ApiConfig::load();
    let log_level = config
        .as_ref()
        .map(|c| c.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_tracing(&log_level);

    let config = config.map_err(|err| {
        error!(error = %err, "Invalid configuration");
        err
    })?;
    info!(config = ?config, "Service configured");

    let registry = MetricRegistry::new()?;
    let gauges = GaugeSet::new(&registry)?;
    let poll_metrics = PollMetrics::new(&registry)?;

    let instance = std::env::var("HOSTNAME").unwrap_or_else(|_| "k8s-metrics-api".to_string());
    let logger = StructuredLogger::new(instance);

    let reader = KubeClusterReader::try_default(config.list_page_size).await?;
    let aggregator = Aggregator::new(Arc::new(reader), gauges, poll_metrics, logger.clone());

    let health_registry = HealthRegistry::new();
    health_registry.register(components::CLUSTER_READER).await;

    let state = Arc::new(
        AppState::new(
            aggregator,
            registry,
            health_registry.clone(),
            config.expected_auth_token.clone(),
            config.poll_budget(),
        )
        .with_scrape_triggers_poll(config.scrape_triggers_poll),
    );

    health_registry.set_ready(true).await;
    logger.log_startup(SERVICE_VERSION, config.port);

    api::serve(config.port, state, shutdown_signal(logger)).await
}
