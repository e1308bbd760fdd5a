//! Operator CLI for the CTF deployer.
//!
//! `deployctl up` validates the configuration, claims the instance lock,
//! and brings the compose stack up; `deployctl down` tears it down and
//! releases the lock. Validation failures exit non-zero with a structured
//! message.

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "deployctl", about = "Operate the CTF challenge deployer stack")]
struct Cli {
    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate, lock, and start the deployer stack.
    Up {
        /// Skip pre-deploy validations.
        #[arg(short = 's', long)]
        skip_validation: bool,
        /// Run the post-deploy smoke test against /health.
        #[arg(short = 'p', long)]
        smoke: bool,
        /// Run the unit suite before deploying.
        #[arg(short = 'u', long)]
        unit: bool,
    },
    /// Stop the deployer stack and release the instance lock.
    Down,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let result = match cli.command {
        Command::Up {
            skip_validation,
            smoke,
            unit,
        } => commands::up(skip_validation, smoke, unit).await,
        Command::Down => commands::down().await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
