use anyhow::{Context, Result};
use tracing::info;

use deployer::conf::DeployerConfig;
use deployer::runtime;

#[tokio::main]
async fn main() -> Result<()> {
    // Phase 1: basic tracing so config loading can log; replaced once the
    // configured format/level are known.
    let basic_tracing = runtime::init_logging_basic();

    let config = DeployerConfig::load().context("Failed to load configuration")?;

    drop(basic_tracing);
    runtime::init_logging_from_config(&config.logging);
    info!("Configuration loaded and validated");

    let (state, _lock) = runtime::boot(config).await?;

    runtime::serve(state).await
}
