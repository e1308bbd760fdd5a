//! Container rows — CRUD and the queries the orchestrator and janitor run.

use serde::Serialize;
use sqlx::FromRow;

use super::{with_retries, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Stopped,
    Removed,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Running => "running",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Removed => "removed",
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ContainerRow {
    pub id: String,
    pub port: i32,
    pub start_time: i64,
    pub expiration_time: i64,
    pub user_uuid: String,
    pub ip_address: String,
    pub status: String,
}

impl ContainerRow {
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running.as_str()
    }

    pub fn time_left(&self, now: i64) -> i64 {
        (self.expiration_time - now).max(0)
    }
}

impl Store {
    pub async fn insert_container(&self, row: &ContainerRow) -> Result<(), sqlx::Error> {
        let _timer = self.track("insert_container");
        with_retries("insert_container", || async {
            sqlx::query(
                "INSERT INTO containers
                     (id, port, start_time, expiration_time, user_uuid, ip_address, status)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(&row.id)
            .bind(row.port)
            .bind(row.start_time)
            .bind(row.expiration_time)
            .bind(&row.user_uuid)
            .bind(&row.ip_address)
            .bind(&row.status)
            .execute(self.pool())
            .await
            .map(|_| ())
        })
        .await
    }

    pub async fn running_for_user(
        &self,
        user_uuid: &str,
    ) -> Result<Option<ContainerRow>, sqlx::Error> {
        let _timer = self.track("running_for_user");
        with_retries("running_for_user", || async {
            sqlx::query_as::<_, ContainerRow>(
                "SELECT * FROM containers WHERE user_uuid = $1 AND status = 'running' LIMIT 1",
            )
            .bind(user_uuid)
            .fetch_optional(self.pool())
            .await
        })
        .await
    }

    pub async fn get_container(&self, id: &str) -> Result<Option<ContainerRow>, sqlx::Error> {
        let _timer = self.track("get_container");
        with_retries("get_container", || async {
            sqlx::query_as::<_, ContainerRow>("SELECT * FROM containers WHERE id = $1")
                .bind(id)
                .fetch_optional(self.pool())
                .await
        })
        .await
    }

    pub async fn count_running(&self) -> Result<i64, sqlx::Error> {
        let _timer = self.track("count_running");
        with_retries("count_running", || async {
            sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM containers WHERE status = 'running'",
            )
            .fetch_one(self.maintenance_pool())
            .await
        })
        .await
    }

    /// All rows ever recorded, for the admin dashboard.
    pub async fn count_total(&self) -> Result<i64, sqlx::Error> {
        let _timer = self.track("count_total");
        with_retries("count_total", || async {
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM containers")
                .fetch_one(self.maintenance_pool())
                .await
        })
        .await
    }

    pub async fn list_containers(&self) -> Result<Vec<ContainerRow>, sqlx::Error> {
        let _timer = self.track("list_containers");
        with_retries("list_containers", || async {
            sqlx::query_as::<_, ContainerRow>(
                "SELECT * FROM containers ORDER BY start_time DESC",
            )
            .fetch_all(self.pool())
            .await
        })
        .await
    }

    pub async fn list_running(&self) -> Result<Vec<ContainerRow>, sqlx::Error> {
        let _timer = self.track("list_running");
        with_retries("list_running", || async {
            sqlx::query_as::<_, ContainerRow>(
                "SELECT * FROM containers WHERE status = 'running' ORDER BY port",
            )
            .fetch_all(self.maintenance_pool())
            .await
        })
        .await
    }

    /// Running containers whose expiration has passed; batch for the sweeper.
    pub async fn expired_running(
        &self,
        now: i64,
        limit: i64,
    ) -> Result<Vec<ContainerRow>, sqlx::Error> {
        let _timer = self.track("expired_running");
        with_retries("expired_running", || async {
            sqlx::query_as::<_, ContainerRow>(
                "SELECT * FROM containers
                 WHERE status = 'running' AND expiration_time <= $1
                 ORDER BY expiration_time
                 LIMIT $2",
            )
            .bind(now)
            .bind(limit)
            .fetch_all(self.maintenance_pool())
            .await
        })
        .await
    }

    /// Transition a container's status. Returns whether a row changed.
    pub async fn set_container_status(
        &self,
        id: &str,
        status: ContainerStatus,
    ) -> Result<bool, sqlx::Error> {
        let _timer = self.track("set_container_status");
        with_retries("set_container_status", || async {
            sqlx::query("UPDATE containers SET status = $2 WHERE id = $1")
                .bind(id)
                .bind(status.as_str())
                .execute(self.pool())
                .await
                .map(|r| r.rows_affected() > 0)
        })
        .await
    }

    pub async fn update_expiration(&self, id: &str, expiration: i64) -> Result<bool, sqlx::Error> {
        let _timer = self.track("update_expiration");
        with_retries("update_expiration", || async {
            sqlx::query(
                "UPDATE containers SET expiration_time = $2
                 WHERE id = $1 AND status = 'running'",
            )
            .bind(id)
            .bind(expiration)
            .execute(self.pool())
            .await
            .map(|r| r.rows_affected() > 0)
        })
        .await
    }
}
