//! `up` / `down` command implementations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use deployer::conf::DeployerConfig;
use deployer::docker::DockerClient;
use deployer::lock::{instance_id, InstanceLock};

const SMOKE_ATTEMPTS: u32 = 30;
const SMOKE_DELAY: Duration = Duration::from_secs(2);

fn install_path() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
}

/// Drive the docker CLI against the same daemon the deployer uses.
fn compose_command(config: &DeployerConfig) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("docker");
    if !config.docker_socket.is_empty() {
        let host = if config.docker_socket.starts_with("unix://")
            || config.docker_socket.starts_with("tcp://")
        {
            config.docker_socket.clone()
        } else {
            format!("unix://{}", config.docker_socket)
        };
        cmd.env("DOCKER_HOST", host);
    }
    cmd.arg("compose")
        .arg("--project-name")
        .arg(&config.compose_project);
    cmd
}

async fn run_step(description: &str, cmd: &mut tokio::process::Command) -> Result<()> {
    info!("{}...", description);
    let status = cmd
        .status()
        .await
        .with_context(|| format!("{} could not start", description))?;
    if !status.success() {
        bail!("{} failed with {}", description, status);
    }
    Ok(())
}

pub async fn up(skip_validation: bool, smoke: bool, unit: bool) -> Result<()> {
    let config = DeployerConfig::load().context("Configuration validation failed")?;
    info!(
        challenge = %config.challenge_name,
        ports = format!("[{}, {})", config.ports.start_range, config.ports.stop_range),
        "Configuration OK"
    );

    if unit {
        run_step(
            "Running unit suite",
            tokio::process::Command::new("cargo").arg("test").arg("--workspace"),
        )
        .await?;
    }

    if skip_validation {
        warn!("Skipping pre-deploy validations (-s)");
    } else {
        preflight(&config).await?;
    }

    // Claimed before compose starts so two stacks cannot race the same
    // range; released again immediately — the deployer process re-acquires
    // and holds it for its own lifetime.
    let lock = InstanceLock::acquire(
        Path::new(&config.maintenance.lock_dir),
        config.ports.start_range,
        config.ports.stop_range,
        &install_path(),
    )
    .context("Another instance holds an overlapping port range")?;

    run_step(
        "Starting compose stack",
        compose_command(&config).arg("up").arg("-d"),
    )
    .await?;
    drop(lock);

    if smoke {
        smoke_test(&config).await?;
    }

    info!("Stack is up");
    Ok(())
}

pub async fn down() -> Result<()> {
    let config = DeployerConfig::load().context("Configuration validation failed")?;

    run_step("Stopping compose stack", compose_command(&config).arg("down")).await?;

    // Clear any lock this install left behind.
    let own = instance_id(&install_path());
    let lock_dir = Path::new(&config.maintenance.lock_dir);
    if let Ok(entries) = std::fs::read_dir(lock_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().contains(&own) {
                let _ = std::fs::remove_file(entry.path());
                info!(lock = %entry.path().display(), "Removed lock file");
            }
        }
    }

    info!("Stack is down");
    Ok(())
}

/// Pre-deploy validation: the engine answers, and no stray process holds
/// ports from the allocation range.
async fn preflight(config: &DeployerConfig) -> Result<()> {
    info!("Checking engine reachability...");
    let docker =
        DockerClient::new(&config.docker_socket).context("Docker client construction failed")?;
    docker
        .ping()
        .await
        .context("Docker daemon is not reachable")?;

    let mut busy = Vec::new();
    for port in [config.ports.api_port, config.ports.direct_test_port] {
        if std::net::TcpListener::bind(("0.0.0.0", port)).is_err() {
            busy.push(port);
        }
    }
    if !busy.is_empty() {
        bail!(
            "Ports already in use on this host: {:?} — stop the conflicting services or run with -s",
            busy
        );
    }

    info!("Pre-deploy validation passed");
    Ok(())
}

/// Poll /health until it answers or the budget runs out.
async fn smoke_test(config: &DeployerConfig) -> Result<()> {
    let url = format!("http://127.0.0.1:{}/health", config.ports.api_port);
    info!(url = %url, "Running post-deploy smoke test");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()
        .context("HTTP client construction failed")?;

    for attempt in 1..=SMOKE_ATTEMPTS {
        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                let body: serde_json::Value = response
                    .json()
                    .await
                    .context("Health endpoint returned invalid JSON")?;
                if body.get("ok") == Some(&serde_json::Value::Bool(true)) {
                    info!("Smoke test passed");
                    return Ok(());
                }
                bail!("Health endpoint answered but reported not-ok: {}", body);
            }
            Ok(response) => {
                warn!(status = %response.status(), attempt, "Health endpoint not ready");
            }
            Err(e) => {
                warn!(error = %e, attempt, "Health endpoint not reachable yet");
            }
        }
        tokio::time::sleep(SMOKE_DELAY).await;
    }

    bail!("Smoke test failed: /health did not become ready")
}
