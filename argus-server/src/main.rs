//! Argus Server - Transparent reverse proxy that extracts inference metrics

mod backend;
mod error;
mod exposition;
mod proxy;
mod quantile;
mod server;
mod shutdown;
mod stats;
mod stream;

use anyhow::Result;
use argus_common::ArgusConfig;
use backend::Backend;
use shutdown::Shutdown;
use stats::StatsStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long in-flight connections get to finish after Ctrl-C
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shared application state
pub struct AppState {
    pub config: ArgusConfig,
    pub stats: Arc<StatsStore>,
    pub backend: Backend,
    pub shutdown: Shutdown,
}

impl AppState {
    pub fn new(config: ArgusConfig, shutdown: Shutdown) -> Arc<Self> {
        Arc::new(Self {
            stats: Arc::new(StatsStore::new(config.metrics.max_samples)),
            backend: Backend::new(&config.backend),
            config,
            shutdown,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("argus_server=info".parse()?),
        )
        .init();

    info!("Starting Argus v{}", env!("CARGO_PKG_VERSION"));

    // Determine config path
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("argus.toml"));

    // Load or create default configuration
    let config = if config_path.exists() {
        info!("Loading configuration from {}", config_path.display());
        ArgusConfig::load(&config_path)?
    } else {
        info!("No configuration file found, using defaults");
        let config = ArgusConfig::default();
        // Save default config for reference
        if let Err(e) = config.save(&config_path) {
            error!("Failed to save default config: {}", e);
        }
        config
    };
    config.validate()?;

    let (trigger, shutdown) = shutdown::channel();
    let state = AppState::new(config, shutdown);

    // Requests retry the backend on their own, so an unreachable backend is not fatal
    let mut probe_shutdown = state.shutdown.clone();
    match state.backend.verify_connection(&mut probe_shutdown).await {
        Ok(()) => info!("Connected to backend at {}", state.backend.base_url()),
        Err(e) => warn!(
            "Failed to connect to backend at {}: {}; will retry on proxy requests",
            state.backend.base_url(),
            e
        ),
    }

    // Start HTTP server
    let server_state = state.clone();
    let mut server_handle = tokio::spawn(async move { server::run_server(server_state).await });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut server_handle => {
            // Bind failures land here and abort startup
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(e.into()),
            };
        }
    }

    trigger.trigger();
    match tokio::time::timeout(SHUTDOWN_GRACE, server_handle).await {
        Ok(Ok(Err(e))) => error!("HTTP server error: {}", e),
        Ok(Err(e)) => error!("Server task failed: {}", e),
        Ok(Ok(Ok(()))) => {}
        Err(_) => warn!("Server did not stop within {:?}", SHUTDOWN_GRACE),
    }

    log_final_summary(&state.stats);
    info!("Argus shutdown complete");
    Ok(())
}

fn log_final_summary(stats: &StatsStore) {
    let requests = stats.request_counts();
    let durations = stats.duration_stats();
    for (model, count) in &requests {
        match durations.get(model) {
            Some(summary) => info!("{}: {} requests, {}", model, count, summary),
            None => info!("{}: {} requests", model, count),
        }
    }
}
