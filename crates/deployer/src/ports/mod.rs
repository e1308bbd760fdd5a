//! Port allocator — atomic reservation and release of host TCP ports.
//!
//! The `port_allocations` table is authoritative. Reservation claims the
//! lowest free row inside a single transaction using `FOR UPDATE SKIP
//! LOCKED`, so competing reservers never observe the same row as free. An
//! OS-level bind probe after the claim catches engine-state desync: a port
//! that is busy on the host is quarantined under a synthetic owner and the
//! reservation retries.

use std::net::TcpListener;
use std::sync::Arc;

use crate::error::DeployError;
use crate::metrics::DeployerMetrics;
use crate::store::Store;

/// Owner prefix for quarantined rows; swept once they age out.
const STALE_OWNER_PREFIX: &str = "stale-";

pub struct PortAllocator {
    store: Arc<Store>,
    metrics: Arc<DeployerMetrics>,
    max_attempts: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct PortCounts {
    pub allocated: i64,
    pub free: i64,
}

impl PortAllocator {
    pub fn new(store: Arc<Store>, metrics: Arc<DeployerMetrics>, max_attempts: u32) -> Self {
        Self {
            store,
            metrics,
            max_attempts,
        }
    }

    /// Reserve the lowest free port for `owner`.
    ///
    /// Each attempt is one indivisible select-and-claim transaction. Ports
    /// that turn out to be bound on the host are quarantined and the loop
    /// moves on; an empty pool or exhausted retries yield `PortPoolFull`.
    pub async fn reserve(&self, owner: &str, now: i64) -> Result<u16, DeployError> {
        for attempt in 0..self.max_attempts {
            let claimed = self.claim_lowest_free(owner, now).await?;
            let port = match claimed {
                Some(port) => port,
                None => {
                    tracing::warn!(owner = %owner, "Port pool exhausted");
                    self.metrics.port_allocation_failures_total.inc();
                    return Err(DeployError::PortPoolFull);
                }
            };

            if os_port_free(port) {
                tracing::debug!(port = port, owner = %owner, "Reserved port");
                return Ok(port as u16);
            }

            // The table said free but the host disagrees; quarantine the
            // row under a synthetic owner so the sweeper reclaims it later.
            tracing::warn!(
                port = port,
                attempt = attempt + 1,
                "Port busy on host despite free reservation row, quarantining"
            );
            self.quarantine(port, now).await?;
        }

        self.metrics.port_allocation_failures_total.inc();
        Err(DeployError::PortPoolFull)
    }

    async fn claim_lowest_free(&self, owner: &str, now: i64) -> Result<Option<i32>, sqlx::Error> {
        let _timer = self.store.track("port_reserve");
        let mut tx = self.store.pool().begin().await?;

        let port: Option<i32> = sqlx::query_scalar(
            "SELECT port FROM port_allocations
             WHERE allocated = FALSE
             ORDER BY port
             LIMIT 1
             FOR UPDATE SKIP LOCKED",
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(port) = port else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query(
            "UPDATE port_allocations
             SET allocated = TRUE, container_id = $2, allocated_at = $3
             WHERE port = $1",
        )
        .bind(port)
        .bind(owner)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(port))
    }

    async fn quarantine(&self, port: i32, now: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE port_allocations
             SET allocated = TRUE, container_id = $2, allocated_at = $3
             WHERE port = $1",
        )
        .bind(port)
        .bind(format!("{}{}", STALE_OWNER_PREFIX, now))
        .bind(now)
        .execute(self.store.pool())
        .await
        .map(|_| ())
    }

    /// Point the reservation at the engine-assigned container id once it is
    /// known (reservation happens before create, under a placeholder).
    pub async fn rebind(&self, port: u16, owner: &str) -> Result<(), sqlx::Error> {
        let _timer = self.store.track("port_rebind");
        sqlx::query("UPDATE port_allocations SET container_id = $2 WHERE port = $1")
            .bind(port as i32)
            .bind(owner)
            .execute(self.store.pool())
            .await
            .map(|_| ())
    }

    /// Idempotent release. Releasing an already-free port is a no-op.
    pub async fn release(&self, port: u16) -> Result<(), DeployError> {
        let _timer = self.store.track("port_release");
        sqlx::query(
            "UPDATE port_allocations
             SET allocated = FALSE, container_id = NULL, allocated_at = NULL
             WHERE port = $1",
        )
        .bind(port as i32)
        .execute(self.store.pool())
        .await?;
        tracing::debug!(port = port, "Released port");
        Ok(())
    }

    /// Free every reservation older than `max_age` whose owner is not a
    /// running container. Invoked by the janitor.
    pub async fn sweep(&self, now: i64, max_age: i64) -> Result<u64, sqlx::Error> {
        let _timer = self.store.track("port_sweep");
        let released = sqlx::query(
            "UPDATE port_allocations
             SET allocated = FALSE, container_id = NULL, allocated_at = NULL
             WHERE allocated = TRUE
               AND allocated_at < $1
               AND (container_id IS NULL OR container_id NOT IN
                    (SELECT id FROM containers WHERE status = 'running'))",
        )
        .bind(now - max_age)
        .execute(self.store.maintenance_pool())
        .await?
        .rows_affected();

        if released > 0 {
            tracing::info!(released = released, "Swept stale port reservations");
        }
        Ok(released)
    }

    /// Pool occupancy; also refreshes the `ctf_port_pool` gauges.
    pub async fn counts(&self) -> Result<PortCounts, sqlx::Error> {
        let _timer = self.store.track("port_counts");
        let (allocated, free): (i64, i64) = sqlx::query_as(
            "SELECT
                 COUNT(*) FILTER (WHERE allocated),
                 COUNT(*) FILTER (WHERE NOT allocated)
             FROM port_allocations",
        )
        .fetch_one(self.store.maintenance_pool())
        .await?;

        self.metrics
            .port_pool
            .with_label_values(&["allocated"])
            .set(allocated);
        self.metrics.port_pool.with_label_values(&["free"]).set(free);

        Ok(PortCounts { allocated, free })
    }
}

/// Belt-and-braces host-level check: can we bind the port right now?
/// The reservation table stays authoritative; this only catches desync.
pub fn os_port_free(port: i32) -> bool {
    match u16::try_from(port) {
        Ok(p) => TcpListener::bind(("0.0.0.0", p)).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_port_free_detects_bound_port() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port() as i32;
        assert!(!os_port_free(port));
        drop(listener);
        assert!(os_port_free(port));
    }

    #[test]
    fn test_os_port_free_rejects_out_of_range() {
        assert!(!os_port_free(-1));
        assert!(!os_port_free(70000));
    }

    #[test]
    fn test_stale_owner_prefix_shape() {
        let owner = format!("{}{}", STALE_OWNER_PREFIX, 1700000000);
        assert!(owner.starts_with("stale-"));
    }
}
