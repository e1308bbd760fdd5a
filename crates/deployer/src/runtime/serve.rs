//! Serve — HTTP listener with graceful shutdown.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::api::build_router;
use crate::state::SharedState;

pub async fn serve(state: SharedState) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.ports.api_port));
    let app = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind the API port")?;

    info!("CTF deployer API ready");
    info!("Listening on: http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    // Signal background tasks (monitor, dispatcher, sweeper) to stop.
    state.shutdown();
    info!("Server shut down gracefully");
    Ok(())
}

/// Graceful shutdown on SIGINT / SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}
