//! Sweeper — periodic batch reclamation and auxiliary cleanup.
//!
//! Each pass: reclaim a batch of expired containers (one sub-scope per
//! container so a single failure does not block the batch), sweep orphaned
//! port reservations, purge aged rate-limit rows, drop expired captchas.
//! Items that keep failing are retried with exponential dampening up to a
//! cap — the sweeper never gives up on an item entirely.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::reclaim;
use crate::state::SharedState;

/// Dampening: first retry after one interval, doubling up to this cap.
const DAMPENING_CAP_SEC: i64 = 3600;

#[derive(Debug, Clone, Copy)]
struct ItemBackoff {
    failures: u32,
    next_attempt: i64,
}

pub async fn sweeper_loop(state: SharedState, shutdown: CancellationToken) {
    let interval_sec = state.config.maintenance.maintenance_interval_sec.max(1);
    info!(interval = interval_sec, "Starting sweeper task");

    let mut interval = time::interval(Duration::from_secs(interval_sec));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut backoffs: HashMap<String, ItemBackoff> = HashMap::new();

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => {
                info!("Sweeper stopping");
                return;
            }
        }

        // Finish the pass even if shutdown arrives mid-batch; the next
        // iteration will not start.
        sweep_pass(&state, &mut backoffs, interval_sec as i64).await;

        if shutdown.is_cancelled() {
            info!("Sweeper stopping after in-flight pass");
            return;
        }
    }
}

async fn sweep_pass(
    state: &SharedState,
    backoffs: &mut HashMap<String, ItemBackoff>,
    interval_sec: i64,
) {
    let now = chrono::Utc::now().timestamp();

    let batch = match state
        .store
        .expired_running(now, state.config.maintenance.maintenance_batch_size)
        .await
    {
        Ok(batch) => batch,
        Err(e) => {
            error!(error = %e, "Sweeper could not query expired containers");
            return;
        }
    };

    let mut reclaimed = 0usize;
    for row in &batch {
        if let Some(backoff) = backoffs.get(&row.id) {
            if backoff.next_attempt > now {
                debug!(
                    container_id = %row.id,
                    next_attempt = backoff.next_attempt,
                    "Skipping dampened container this pass"
                );
                continue;
            }
        }

        match reclaim(state, row).await {
            Ok(()) => {
                backoffs.remove(&row.id);
                reclaimed += 1;
            }
            Err(_phase) => {
                let failures = backoffs.get(&row.id).map(|b| b.failures + 1).unwrap_or(1);
                backoffs.insert(
                    row.id.clone(),
                    ItemBackoff {
                        failures,
                        next_attempt: now + dampening_delay(failures, interval_sec),
                    },
                );
            }
        }
    }

    if let Err(e) = state
        .ports
        .sweep(now, state.config.maintenance.stale_port_max_age)
        .await
    {
        error!(error = %e, "Port sweep failed");
    }

    let cutoff = now - state.config.rate_limit.rate_limit_window_sec;
    match state.store.purge_ip_requests(cutoff).await {
        Ok(purged) if purged > 0 => debug!(purged = purged, "Purged aged rate-limit rows"),
        Ok(_) => {}
        Err(e) => error!(error = %e, "Rate-limit purge failed"),
    }

    let dropped = state.captcha.purge_expired(now);
    if dropped > 0 {
        debug!(dropped = dropped, "Purged expired captchas");
    }

    // Entries whose container left the expired set (reclaimed elsewhere or
    // extended) no longer need dampening state.
    let batch_ids: std::collections::HashSet<&str> =
        batch.iter().map(|r| r.id.as_str()).collect();
    backoffs.retain(|id, _| batch_ids.contains(id.as_str()));

    if reclaimed > 0 || !batch.is_empty() {
        info!(
            expired = batch.len(),
            reclaimed = reclaimed,
            dampened = backoffs.len(),
            "Sweeper pass complete"
        );
    }
}

fn dampening_delay(failures: u32, interval_sec: i64) -> i64 {
    let exp = failures.saturating_sub(1).min(16);
    (interval_sec.max(1))
        .saturating_mul(1i64 << exp)
        .min(DAMPENING_CAP_SEC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dampening_doubles_per_failure() {
        assert_eq!(dampening_delay(1, 60), 60);
        assert_eq!(dampening_delay(2, 60), 120);
        assert_eq!(dampening_delay(3, 60), 240);
    }

    #[test]
    fn test_dampening_caps() {
        assert_eq!(dampening_delay(10, 60), DAMPENING_CAP_SEC);
        // Extreme failure counts must not overflow.
        assert_eq!(dampening_delay(u32::MAX, 60), DAMPENING_CAP_SEC);
    }

    #[test]
    fn test_dampening_handles_zero_interval() {
        assert_eq!(dampening_delay(1, 0), 1);
    }
}
