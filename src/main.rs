//! # Cache Engine binary
//!
//! Loads the configuration, initializes logging and metrics, builds the engine over the
//! configured backend and runs until interrupted.
//!
//! The configuration path comes from `CACHE_ENGINE_CONFIG_PATH` (default
//! `config/cache-engine.yaml`); a missing file falls back to defaults plus environment
//! overrides.

use anyhow::Context;
use cache_engine::observability::{init_logging, install_prometheus_exporter};
use cache_engine::{CacheEngine, EngineConfig};
use std::path::Path;
use tokio::signal;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "config/cache-engine.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config().await?;

    init_logging(&config.logging);
    info!("Starting cache engine v{}", env!("CARGO_PKG_VERSION"));

    if config.metrics.enabled {
        install_prometheus_exporter(&config.metrics).context("failed to start metrics exporter")?;
    }

    let engine = CacheEngine::connect(config)
        .await
        .context("failed to initialize cache engine")?;

    match engine.backend().health_check().await {
        Ok(true) => info!("Cache backend reachable"),
        Ok(false) => warn!("Cache backend reported unhealthy, caching will degrade"),
        Err(e) => warn!("Cache backend health check failed, caching will degrade: {}", e),
    }

    info!("Cache engine running, press Ctrl-C to stop");
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }

    engine.shutdown().await;
    info!("Cache engine shutdown complete");
    Ok(())
}

async fn load_config() -> anyhow::Result<EngineConfig> {
    let path = std::env::var("CACHE_ENGINE_CONFIG_PATH")
        .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    if Path::new(&path).exists() {
        return EngineConfig::load_from_file(&path)
            .await
            .with_context(|| format!("failed to load configuration from {}", path));
    }

    let mut config = EngineConfig::default();
    config
        .apply_env_overrides()
        .context("invalid environment override")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}
