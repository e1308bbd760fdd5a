//! Expiry dispatcher — one task, one heap, a bounded reclamation pool.
//!
//! Replaces thread-per-container monitoring: every running container is an
//! entry in the expiry queue; a single dispatcher sleeps until the earliest
//! deadline and hands due containers to workers drawn from a semaphore of
//! `thread_pool_size` permits. Workers sleep for minutes, not milliseconds,
//! so queueing behind a saturated pool is acceptable.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::reclaim;
use crate::state::SharedState;

pub async fn expiry_dispatcher_loop(state: SharedState, shutdown: CancellationToken) {
    let pool_size = state.config.maintenance.thread_pool_size;
    let check_interval =
        Duration::from_secs(state.config.maintenance.container_check_interval_sec.max(1));
    let semaphore = Arc::new(Semaphore::new(pool_size));

    info!(
        pool_size = pool_size,
        check_interval_secs = check_interval.as_secs(),
        "Starting expiry dispatcher"
    );

    loop {
        let now = chrono::Utc::now().timestamp();

        if let Some((deadline, container_id)) = state.expiry.pop_due(now) {
            debug!(
                container_id = %container_id,
                deadline = deadline,
                "Expiry deadline reached"
            );
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return, // semaphore closed, shutting down
            };
            let worker_state = state.clone();
            tokio::spawn(async move {
                let _permit = permit;
                handle_due(worker_state, container_id).await;
            });
            continue;
        }

        // Sleep until the earliest deadline, the periodic re-check, a poke
        // from schedule/extend, or shutdown — whichever comes first.
        let sleep_for = match state.expiry.next_deadline() {
            Some((at, _)) => {
                let until = (at - now).max(0) as u64;
                Duration::from_secs(until).min(check_interval)
            }
            None => check_interval,
        };

        tokio::select! {
            _ = time::sleep(sleep_for) => {}
            _ = state.expiry.notified() => {}
            _ = shutdown.cancelled() => {
                info!("Expiry dispatcher stopping");
                return;
            }
        }
    }
}

/// A deadline fired: re-read the authoritative row and act on what it says
/// now, not on what it said when the entry was scheduled.
async fn handle_due(state: SharedState, container_id: String) {
    let row = match state.store.get_container(&container_id).await {
        Ok(Some(row)) => row,
        Ok(None) => {
            state.monitors.cancel(&container_id);
            return;
        }
        Err(e) => {
            warn!(
                container_id = %container_id,
                error = %e,
                "Could not re-read container at expiry, retrying later"
            );
            let retry_at = chrono::Utc::now().timestamp()
                + state.config.maintenance.container_check_interval_sec as i64;
            state.expiry.schedule(retry_at, &container_id);
            return;
        }
    };

    if !row.is_running() {
        state.monitors.cancel(&container_id);
        return;
    }

    let now = chrono::Utc::now().timestamp();
    if row.expiration_time > now {
        // Extended since this entry was scheduled; sleep again.
        debug!(
            container_id = %container_id,
            new_expiration = row.expiration_time,
            "Expiration moved, rescheduling monitor"
        );
        state.expiry.schedule(row.expiration_time, &container_id);
        return;
    }

    if reclaim(&state, &row).await.is_err() {
        // The sweeper retries with dampening on its next pass.
        warn!(container_id = %container_id, "Monitor reclamation failed, deferring to sweeper");
    }
}
