//! Store — relational persistence on PostgreSQL.
//!
//! Two independent connection pools: the primary pool serves user-facing
//! requests, the maintenance pool serves the janitor and the resource
//! monitor, so neither side can starve the other. All atomicity claims in
//! the orchestration layer rest on transactions executed here.

pub mod containers;
pub mod rate;

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;

use crate::conf::{MaintenanceConfig, StoreConfig};
use crate::metrics::DeployerMetrics;

/// Transient store failures are retried with exponential backoff up to this
/// many attempts; logical errors propagate immediately.
pub(crate) const MAX_RETRIES: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(100);
const CONNECT_ATTEMPTS: u32 = 10;

/// Classify an sqlx error as transient (connectivity) vs logical.
pub fn is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

pub(crate) fn retry_backoff(attempt: u32) -> Duration {
    RETRY_BASE * 2u32.saturating_pow(attempt)
}

/// Run a store closure, retrying transient failures with backoff.
pub(crate) async fn with_retries<T, F, Fut>(op: &'static str, mut run: F) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 0;
    loop {
        match run().await {
            Ok(v) => return Ok(v),
            Err(e) if is_transient(&e) && attempt < MAX_RETRIES => {
                tracing::warn!(
                    op = op,
                    attempt = attempt + 1,
                    error = %e,
                    "Transient store failure, retrying"
                );
                tokio::time::sleep(retry_backoff(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

pub struct Store {
    pool: PgPool,
    maintenance: PgPool,
    metrics: Arc<DeployerMetrics>,
}

impl Store {
    /// Connect both pools, retrying transient connect failures with backoff.
    pub async fn connect(
        store: &StoreConfig,
        maintenance: &MaintenanceConfig,
        metrics: Arc<DeployerMetrics>,
    ) -> Result<Self, sqlx::Error> {
        let url = store.url();
        let pool = Self::connect_pool(&url, store.pool_min, store.pool_max).await?;
        tracing::info!(
            host = %store.host,
            db = %store.name,
            max = store.pool_max,
            "Connected primary store pool"
        );
        let maintenance_pool = Self::connect_pool(
            &url,
            maintenance.maintenance_pool_min,
            maintenance.maintenance_pool_max,
        )
        .await?;
        tracing::info!(
            max = maintenance.maintenance_pool_max,
            "Connected maintenance store pool"
        );

        Ok(Self {
            pool,
            maintenance: maintenance_pool,
            metrics,
        })
    }

    async fn connect_pool(url: &str, min: u32, max: u32) -> Result<PgPool, sqlx::Error> {
        let mut attempt = 0;
        loop {
            let result = PgPoolOptions::new()
                .min_connections(min)
                .max_connections(max)
                .acquire_timeout(Duration::from_secs(5))
                .connect(url)
                .await;
            match result {
                Ok(pool) => return Ok(pool),
                Err(e) if attempt < CONNECT_ATTEMPTS => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        error = %e,
                        "Database not reachable yet, backing off"
                    );
                    tokio::time::sleep(retry_backoff(attempt.min(5))).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn maintenance_pool(&self) -> &PgPool {
        &self.maintenance
    }

    /// Count an operation and start its latency timer. The timer observes
    /// on drop.
    pub(crate) fn track(&self, op: &'static str) -> prometheus::HistogramTimer {
        self.metrics
            .database_operations_total
            .with_label_values(&[op])
            .inc();
        self.metrics.database_operation_duration.start_timer()
    }

    /// Create the schema idempotently. Runs on the maintenance pool.
    pub async fn init_schema(&self) -> Result<(), sqlx::Error> {
        const DDL: &[&str] = &[
            "CREATE TABLE IF NOT EXISTS containers (
                id              TEXT PRIMARY KEY,
                port            INTEGER NOT NULL,
                start_time      BIGINT NOT NULL,
                expiration_time BIGINT NOT NULL,
                user_uuid       TEXT NOT NULL,
                ip_address      TEXT NOT NULL,
                status          TEXT NOT NULL DEFAULT 'running'
            )",
            "CREATE INDEX IF NOT EXISTS idx_containers_user_running
                ON containers (user_uuid) WHERE status = 'running'",
            "CREATE INDEX IF NOT EXISTS idx_containers_expiration
                ON containers (expiration_time) WHERE status = 'running'",
            "CREATE TABLE IF NOT EXISTS port_allocations (
                port         INTEGER PRIMARY KEY,
                allocated    BOOLEAN NOT NULL DEFAULT FALSE,
                container_id TEXT,
                allocated_at BIGINT
            )",
            "CREATE TABLE IF NOT EXISTS ip_requests (
                ip_address   TEXT NOT NULL,
                request_time BIGINT NOT NULL,
                PRIMARY KEY (ip_address, request_time)
            )",
        ];
        for statement in DDL {
            sqlx::query(statement).execute(&self.maintenance).await?;
        }
        tracing::info!("Schema ready");
        Ok(())
    }

    /// Seed one port row per integer in `[start, stop)` and drop unallocated
    /// rows that fell out of the configured range.
    pub async fn seed_ports(&self, start: u16, stop: u16) -> Result<(), sqlx::Error> {
        let inserted = sqlx::query(
            "INSERT INTO port_allocations (port, allocated)
             SELECT generate_series($1::INT, $2::INT - 1), FALSE
             ON CONFLICT (port) DO NOTHING",
        )
        .bind(start as i32)
        .bind(stop as i32)
        .execute(&self.maintenance)
        .await?
        .rows_affected();

        let dropped = sqlx::query(
            "DELETE FROM port_allocations
             WHERE (port < $1 OR port >= $2) AND allocated = FALSE",
        )
        .bind(start as i32)
        .bind(stop as i32)
        .execute(&self.maintenance)
        .await?
        .rows_affected();

        tracing::info!(
            start = start,
            stop = stop,
            seeded = inserted,
            dropped = dropped,
            "Port pool seeded"
        );
        Ok(())
    }

    /// Pool occupancy snapshot for the admin endpoint and gauges.
    pub fn pool_status(&self) -> PoolStatus {
        let status = PoolStatus {
            size: self.pool.size(),
            idle: self.pool.num_idle() as u32,
            max: self.pool.options().get_max_connections(),
        };
        self.metrics
            .database_connection_pool
            .with_label_values(&["size"])
            .set(status.size as i64);
        self.metrics
            .database_connection_pool
            .with_label_values(&["idle"])
            .set(status.idle as i64);
        self.metrics
            .database_connection_pool
            .with_label_values(&["max"])
            .set(status.max as i64);
        status
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    pub size: u32,
    pub idle: u32,
    pub max: u32,
}

#[cfg(test)]
impl Store {
    /// Lazily-connecting store for router tests; no database is contacted
    /// until a query runs.
    pub(crate) fn connect_lazy_for_tests(url: &str, metrics: Arc<DeployerMetrics>) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect_lazy(url)
            .expect("lazy pool");
        let maintenance = PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy(url)
            .expect("lazy pool");
        Self {
            pool,
            maintenance,
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(is_transient(&io));
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
        assert!(!is_transient(&sqlx::Error::RowNotFound));
        assert!(!is_transient(&sqlx::Error::ColumnNotFound("port".into())));
    }

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(retry_backoff(0), Duration::from_millis(100));
        assert_eq!(retry_backoff(1), Duration::from_millis(200));
        assert_eq!(retry_backoff(3), Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_with_retries_gives_up_on_logical_error() {
        let mut calls = 0u32;
        let result: Result<(), sqlx::Error> = with_retries("test", || {
            calls += 1;
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_with_retries_retries_transient_then_succeeds() {
        let mut calls = 0u32;
        let result: Result<u32, sqlx::Error> = with_retries("test", || {
            calls += 1;
            let succeed = calls > 2;
            async move {
                if succeed {
                    Ok(7)
                } else {
                    Err(sqlx::Error::PoolTimedOut)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls, 3);
    }
}
