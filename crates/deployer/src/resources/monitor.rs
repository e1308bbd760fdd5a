//! Background refresh task for the resource snapshot.

use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{ResourceClass, ResourceSnapshot};
use crate::state::SharedState;

const STATS_TIMEOUT: Duration = Duration::from_secs(5);

/// Periodically aggregate live usage into the monitor's snapshot.
///
/// Runs until `shutdown` is cancelled. On error the previous snapshot is
/// preserved; stale data is better than no data.
pub async fn resource_monitor_loop(state: SharedState, shutdown: CancellationToken) {
    let interval_secs = state.resources.check_interval_sec();
    tracing::info!(
        interval = interval_secs,
        "Starting resource monitor task"
    );

    let mut interval = time::interval(Duration::from_secs(interval_secs.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut consecutive_failures: u32 = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => {
                tracing::info!("Resource monitor stopping");
                return;
            }
        }

        match refresh_once(&state).await {
            Ok(snapshot) => {
                consecutive_failures = 0;
                debug!(
                    containers = snapshot.containers.current,
                    cpu_percent = snapshot.cpu.current,
                    memory_bytes = snapshot.memory.current,
                    "Resource snapshot refreshed"
                );
                state.resources.update(snapshot);
                state
                    .metrics
                    .active_containers
                    .set(snapshot.containers.current as i64);
            }
            Err(e) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                error!(
                    attempt = consecutive_failures,
                    error = %e,
                    "Resource snapshot refresh failed, keeping previous snapshot"
                );
            }
        }
    }
}

async fn refresh_once(state: &SharedState) -> Result<ResourceSnapshot, crate::error::DeployError> {
    let running = state.store.list_running().await?;
    let containers_current = running.len() as f64;

    let mut cpu_total = 0.0;
    let mut memory_total: u64 = 0;
    for row in &running {
        match time::timeout(STATS_TIMEOUT, state.docker.usage_once(&row.id)).await {
            Ok(Ok(usage)) => {
                cpu_total += usage.cpu_percent;
                memory_total += usage.memory_bytes;
            }
            Ok(Err(e)) if e.is_not_found() => {
                // The janitor will reconcile the row; nothing to count.
                debug!(container_id = %row.id, "Container gone while sampling stats");
            }
            Ok(Err(e)) => {
                warn!(container_id = %row.id, error = %e, "Stats sampling failed");
            }
            Err(_) => {
                warn!(container_id = %row.id, "Stats sampling timed out");
            }
        }
    }

    let port_counts = state.ports.counts().await?;

    let previous = state.resources.snapshot();
    Ok(ResourceSnapshot {
        containers: ResourceClass {
            current: containers_current,
            limit: previous.containers.limit,
        },
        cpu: ResourceClass {
            current: cpu_total,
            limit: previous.cpu.limit,
        },
        memory: ResourceClass {
            current: memory_total as f64,
            limit: previous.memory.limit,
        },
        ports: ResourceClass {
            current: port_counts.allocated as f64,
            limit: previous.ports.limit,
        },
        last_updated: chrono::Utc::now().timestamp(),
    })
}
