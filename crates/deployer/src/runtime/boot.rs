//! Boot — logging init, store/engine wiring, background task spawn.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::conf::{DeployerConfig, LoggingConfig};
use crate::docker::DockerClient;
use crate::janitor;
use crate::lock::InstanceLock;
use crate::metrics::DeployerMetrics;
use crate::resources::monitor::resource_monitor_loop;
use crate::state::{AppState, SharedState};
use crate::store::Store;

/// Phase 1: basic tracing so config loading can log. Thread-local so the
/// global slot stays free for the config-driven subscriber.
pub fn init_logging_basic() -> tracing::subscriber::DefaultGuard {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,deployer=debug"));
    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    tracing::subscriber::set_default(subscriber)
}

/// Phase 2: the real subscriber, honoring the configured level and format.
pub fn init_logging_from_config(config: &LoggingConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.format == "json" {
        let layer = fmt::layer().json().with_target(true);
        tracing_subscriber::registry().with(filter).with(layer).init();
    } else {
        let layer = fmt::layer().with_target(true);
        tracing_subscriber::registry().with(filter).with(layer).init();
    }
}

fn install_path() -> PathBuf {
    std::env::current_exe()
        .or_else(|_| std::env::current_dir())
        .unwrap_or_else(|_| PathBuf::from("/"))
}

/// Wire the whole system: instance lock, store (schema + port seeding),
/// engine client, shared state, and the three background tasks.
///
/// Returns the shared state plus the instance lock, which the caller must
/// keep alive for the lifetime of the process.
pub async fn boot(config: DeployerConfig) -> Result<(SharedState, InstanceLock)> {
    info!(
        challenge = %config.challenge_name,
        ports = format!("[{}, {})", config.ports.start_range, config.ports.stop_range),
        "Starting CTF deployer v{}",
        env!("CARGO_PKG_VERSION")
    );

    let lock = InstanceLock::acquire(
        std::path::Path::new(&config.maintenance.lock_dir),
        config.ports.start_range,
        config.ports.stop_range,
        &install_path(),
    )
    .context("Could not acquire the instance lock")?;

    let metrics = Arc::new(DeployerMetrics::new());

    let store = Store::connect(&config.store, &config.maintenance, metrics.clone())
        .await
        .context("Database connection failed")?;
    store.init_schema().await.context("Schema init failed")?;
    store
        .seed_ports(config.ports.start_range, config.ports.stop_range)
        .await
        .context("Port pool seeding failed")?;

    let docker = DockerClient::new(&config.docker_socket)
        .context("Docker client construction failed")?;
    docker.ping().await.context("Docker daemon not reachable")?;
    info!("Connected to Docker daemon");
    docker
        .ensure_network(&config.network.network_name, &config.network.network_subnet)
        .await
        .context("Challenge network setup failed")?;

    let state: SharedState = Arc::new(AppState::new(config, store, docker, metrics));

    // Rows that claim to be running from a previous life get monitors so
    // expiry still fires; the sweeper reconciles anything that is gone.
    let recovered = state.store.list_running().await?;
    for row in &recovered {
        state.monitors.register(&row.id);
        state.expiry.schedule(row.expiration_time, &row.id);
    }
    if !recovered.is_empty() {
        info!(count = recovered.len(), "Re-armed monitors for existing rows");
    }

    tokio::spawn(resource_monitor_loop(
        state.clone(),
        state.shutdown.clone(),
    ));
    tokio::spawn(janitor::monitor::expiry_dispatcher_loop(
        state.clone(),
        state.shutdown.clone(),
    ));
    tokio::spawn(janitor::sweeper::sweeper_loop(
        state.clone(),
        state.shutdown.clone(),
    ));
    info!("Background tasks started");

    Ok((state, lock))
}
