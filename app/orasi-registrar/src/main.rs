//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Main binary for Orasi Registrar

use clap::Parser;
use orasi_registrar::{
    backend::{AgentConnector, CatalogApi, ConsulConnector, InMemoryRegistry, KvStore},
    FileSnapshotSource, HealthCheckWatcher, Reconciler, RegistrarConfig, RegistrarError,
    RegistrarService, DEFAULT_CONFIG_PATH, REGISTRAR_NAME, REGISTRAR_VERSION,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "orasi-registrar")]
#[command(about = "Publishes cluster workload topology as Consul registrations")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "REGISTRAR_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Cluster state document, overrides `state_file` from the configuration
    #[arg(short, long)]
    state_file: Option<PathBuf>,

    /// Log changes against an in-memory registry instead of Consul
    #[arg(long)]
    dry_run: bool,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    info!("Starting {} v{}", REGISTRAR_NAME, REGISTRAR_VERSION);

    let config = load_config(&cli.config)?;
    info!("Configuration loaded successfully");

    let (connector, catalog_api, kv): (
        Arc<dyn AgentConnector>,
        Arc<dyn CatalogApi>,
        Arc<dyn KvStore>,
    ) = if cli.dry_run {
        info!("Dry run, registrations are only logged");
        let registry = InMemoryRegistry::logging();
        (
            Arc::new(registry.clone()),
            Arc::new(registry.clone()),
            Arc::new(registry),
        )
    } else {
        let connector = ConsulConnector::new(&config.consul)?;
        let seed = Arc::new(connector.seed_client());
        (Arc::new(connector), seed.clone(), seed)
    };

    let state_file = cli
        .state_file
        .unwrap_or_else(|| PathBuf::from(&config.state_file));
    let reconciler = Reconciler::new(&config, connector, catalog_api)?;
    let watcher = Arc::new(HealthCheckWatcher::new(
        kv,
        config.health_check_poll_interval(),
    ));
    let mut service = RegistrarService::new(
        reconciler,
        Arc::new(FileSnapshotSource::new(state_file)),
        watcher.clone(),
        config.refresh_interval(),
    );

    if cli.once {
        if let Err(e) = watcher.refresh().await {
            warn!("Failed to load healthcheck templates: {}", e);
        }
        if let Some(report) = service.run_cycle().await {
            info!(
                "Cycle finished: {} registered, {} deregistered",
                report.registered(),
                report.deregistered()
            );
        }
        return Ok(());
    }

    let handle = service.handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        handle.shutdown();
    });

    service.run().await?;
    info!("Registrar shutdown completed");
    Ok(())
}

/// Load configuration from file, falling back to defaults
fn load_config(path: &Path) -> Result<RegistrarConfig, RegistrarError> {
    let mut config = if path.exists() {
        RegistrarConfig::from_file(path)?
    } else {
        warn!(
            "Config file {} not found, using defaults",
            path.display()
        );
        RegistrarConfig::default()
    };

    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Ctrl+C received, shutting down");
        }
        _ = terminate => {
            info!("SIGTERM received, shutting down");
        }
    }
}
