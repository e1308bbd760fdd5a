//! Sliding-window admission rows — the transactional core of the rate
//! limiter.
//!
//! Counting and inserting happen inside one transaction serialized per
//! source address with a Postgres advisory lock, so two simultaneous
//! admissions from the same address cannot both pass when one slot remains.

use super::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Admitted,
    Rejected { count: i64 },
}

impl Store {
    /// Purge, count, and conditionally record one admission for `ip`.
    ///
    /// The count is the larger of recent admissions in the window and the
    /// source's currently-running containers, so a source cannot launder
    /// slots by stopping instances or by racing the purge.
    pub async fn rate_admit(
        &self,
        ip: &str,
        now: i64,
        window_sec: i64,
        limit: i64,
    ) -> Result<RateDecision, sqlx::Error> {
        let _timer = self.track("rate_admit");
        let mut tx = self.pool().begin().await?;

        // Serialize admissions per source address.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(ip)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM ip_requests WHERE request_time < $1")
            .bind(now - window_sec)
            .execute(&mut *tx)
            .await?;

        let recent: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM ip_requests WHERE ip_address = $1")
                .bind(ip)
                .fetch_one(&mut *tx)
                .await?;

        let running: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM containers WHERE ip_address = $1 AND status = 'running'",
        )
        .bind(ip)
        .fetch_one(&mut *tx)
        .await?;

        let count = recent.max(running);
        if count >= limit {
            // Keep the purge; drop nothing else.
            tx.commit().await?;
            return Ok(RateDecision::Rejected { count });
        }

        sqlx::query(
            "INSERT INTO ip_requests (ip_address, request_time) VALUES ($1, $2)
             ON CONFLICT (ip_address, request_time) DO NOTHING",
        )
        .bind(ip)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(RateDecision::Admitted)
    }

    /// Drop admission rows older than the window. Called by the sweeper.
    pub async fn purge_ip_requests(&self, cutoff: i64) -> Result<u64, sqlx::Error> {
        let _timer = self.track("purge_ip_requests");
        let result = sqlx::query("DELETE FROM ip_requests WHERE request_time < $1")
            .bind(cutoff)
            .execute(self.maintenance_pool())
            .await?;
        Ok(result.rows_affected())
    }
}
