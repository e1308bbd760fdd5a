//! Orchestrator — deploy / stop / restart / extend, composing the store,
//! port allocator, driver, and admission controls.
//!
//! Every public operation runs under a bounded timeout. Failure handling
//! for the deploy pipeline lives in [`deploy`].

pub mod deploy;

use std::sync::Arc;
use std::time::Duration;

use crate::captcha::CaptchaBroker;
use crate::conf::DeployerConfig;
use crate::docker::DockerClient;
use crate::error::DeployError;
use crate::janitor::{ExpiryQueue, Monitors};
use crate::limiter::RateLimiter;
use crate::metrics::DeployerMetrics;
use crate::ports::PortAllocator;
use crate::resources::ResourceMonitor;
use crate::store::containers::{ContainerRow, ContainerStatus};
use crate::store::Store;

/// Attempts for force-removal against a busy engine before surfacing.
const REMOVE_RETRIES: u32 = 3;

pub struct Orchestrator {
    pub(crate) config: Arc<DeployerConfig>,
    pub(crate) store: Arc<Store>,
    pub(crate) docker: DockerClient,
    pub(crate) ports: Arc<PortAllocator>,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) resources: Arc<ResourceMonitor>,
    pub(crate) captcha: Arc<CaptchaBroker>,
    pub(crate) metrics: Arc<DeployerMetrics>,
    pub(crate) expiry: Arc<ExpiryQueue>,
    pub(crate) monitors: Arc<Monitors>,
}

/// What a successful Deploy hands back to the API.
#[derive(Debug, Clone)]
pub struct DeployedInstance {
    pub container_id: String,
    pub port: u16,
    pub expiration_time: i64,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<DeployerConfig>,
        store: Arc<Store>,
        docker: DockerClient,
        ports: Arc<PortAllocator>,
        limiter: Arc<RateLimiter>,
        resources: Arc<ResourceMonitor>,
        captcha: Arc<CaptchaBroker>,
        metrics: Arc<DeployerMetrics>,
        expiry: Arc<ExpiryQueue>,
        monitors: Arc<Monitors>,
    ) -> Self {
        Self {
            config,
            store,
            docker,
            ports,
            limiter,
            resources,
            captcha,
            metrics,
            expiry,
            monitors,
        }
    }

    fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.config.maintenance.operation_timeout_sec.max(1))
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl std::future::Future<Output = Result<T, DeployError>>,
    ) -> Result<T, DeployError> {
        match tokio::time::timeout(self.op_timeout(), fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(op = op, "Operation exceeded its deadline");
                Err(DeployError::EngineTransient(format!("{} timed out", op)))
            }
        }
    }

    /// Stop the caller's running instance: force-remove the engine
    /// container (already-gone is success), mark the row stopped, release
    /// the port, cancel the monitor.
    pub async fn stop(&self, user_uuid: &str) -> Result<(), DeployError> {
        self.bounded("stop", self.stop_inner(user_uuid)).await
    }

    async fn stop_inner(&self, user_uuid: &str) -> Result<(), DeployError> {
        let row = self
            .store
            .running_for_user(user_uuid)
            .await?
            .ok_or(DeployError::NotFound)?;
        self.teardown(&row, ContainerStatus::Stopped).await?;
        tracing::info!(
            container_id = %row.id,
            user_uuid = %user_uuid,
            port = row.port,
            "Instance stopped"
        );
        Ok(())
    }

    /// Replace the caller's instance with a fresh one on a fresh port,
    /// skipping captcha and rate-limit re-validation. Whether the original
    /// expiration carries over is configuration.
    pub async fn restart(&self, user_uuid: &str) -> Result<DeployedInstance, DeployError> {
        self.bounded("restart", self.restart_inner(user_uuid)).await
    }

    async fn restart_inner(&self, user_uuid: &str) -> Result<DeployedInstance, DeployError> {
        let row = self
            .store
            .running_for_user(user_uuid)
            .await?
            .ok_or(DeployError::NotFound)?;

        // Net container count is unchanged by a replacement, so project +0.
        self.resources.admit(0)?;

        self.teardown(&row, ContainerStatus::Stopped).await?;

        let now = chrono::Utc::now().timestamp();
        let expiration = if self.config.lifetime.restart_preserves_expiration {
            row.expiration_time
        } else {
            now + self.config.lifetime.default_lifetime_sec
        };

        let instance = self
            .provision(user_uuid, &row.ip_address, now, expiration)
            .await?;
        tracing::info!(
            container_id = %instance.container_id,
            user_uuid = %user_uuid,
            port = instance.port,
            "Instance restarted"
        );
        Ok(instance)
    }

    /// Push the expiration out by `extension_sec`, from now when already
    /// past-due lapsed, clamped by the configured total-lifetime cap.
    pub async fn extend(&self, user_uuid: &str) -> Result<i64, DeployError> {
        self.bounded("extend", self.extend_inner(user_uuid)).await
    }

    async fn extend_inner(&self, user_uuid: &str) -> Result<i64, DeployError> {
        let row = self
            .store
            .running_for_user(user_uuid)
            .await?
            .ok_or(DeployError::NotFound)?;

        let now = chrono::Utc::now().timestamp();
        let new_expiration = extended_expiration(
            row.start_time,
            row.expiration_time,
            now,
            self.config.lifetime.extension_sec,
            self.config.lifetime.extend_max_total_sec,
        );

        let updated = self.store.update_expiration(&row.id, new_expiration).await?;
        if !updated {
            // Raced with a stop or reclamation.
            return Err(DeployError::NotFound);
        }

        // The dispatcher re-reads the row when the old entry fires; the new
        // entry makes sure it also wakes at the new deadline.
        self.expiry.schedule(new_expiration, &row.id);
        tracing::info!(
            container_id = %row.id,
            user_uuid = %user_uuid,
            new_expiration = new_expiration,
            "Instance lifetime extended"
        );
        Ok(new_expiration)
    }

    /// The caller's running instance, if any.
    pub async fn get_owned(&self, user_uuid: &str) -> Result<Option<ContainerRow>, DeployError> {
        Ok(self.store.running_for_user(user_uuid).await?)
    }

    /// Shared teardown for Stop and Restart.
    async fn teardown(
        &self,
        row: &ContainerRow,
        status: ContainerStatus,
    ) -> Result<(), DeployError> {
        self.monitors.cancel(&row.id);
        // Give the challenge a brief graceful stop before the force-remove;
        // an already-gone or stubborn container is handled by the removal.
        if let Err(e) = self.docker.stop_container(&row.id, 5).await {
            if !e.is_not_found() {
                tracing::debug!(container_id = %row.id, error = %e, "Graceful stop skipped");
            }
        }
        self.remove_engine_container(&row.id).await?;
        self.store.set_container_status(&row.id, status).await?;
        self.ports.release(row.port as u16).await?;

        let lifetime = (chrono::Utc::now().timestamp() - row.start_time).max(0);
        self.metrics.container_lifetime.observe(lifetime as f64);
        Ok(())
    }

    /// Force-remove with bounded retries against transient engine errors.
    /// NotFound is success: the container is already gone.
    pub(crate) async fn remove_engine_container(&self, container_id: &str) -> Result<(), DeployError> {
        let mut attempt = 0;
        loop {
            match self.docker.remove_container(container_id, true).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_not_found() => return Ok(()),
                Err(crate::docker::DriverError::Conflict(detail)) if attempt < REMOVE_RETRIES => {
                    tracing::warn!(
                        container_id = %container_id,
                        attempt = attempt + 1,
                        detail = %detail,
                        "Engine busy during removal, backing off"
                    );
                    tokio::time::sleep(Duration::from_millis(200 * 2u64.pow(attempt))).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Extend math: from `max(expiration, now)` plus the extension, optionally
/// clamped so total lifetime stays within `max_total_sec`.
fn extended_expiration(
    start_time: i64,
    expiration_time: i64,
    now: i64,
    extension_sec: i64,
    max_total_sec: i64,
) -> i64 {
    let mut new_expiration = expiration_time.max(now) + extension_sec;
    if max_total_sec > 0 {
        new_expiration = new_expiration.min(start_time + max_total_sec);
    }
    // Never move the expiration backwards.
    new_expiration.max(expiration_time)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_from_future_expiration() {
        // Deployed at 0, expires at 60, extended at 50 → 90.
        assert_eq!(extended_expiration(0, 60, 50, 30, 0), 90);
    }

    #[test]
    fn test_extend_from_lapsed_expiration_uses_now() {
        // Already past due: extension counts from now.
        assert_eq!(extended_expiration(0, 60, 100, 30, 0), 130);
    }

    #[test]
    fn test_extend_unbounded_when_cap_disabled() {
        let mut expiration = 60;
        for _ in 0..100 {
            expiration = extended_expiration(0, expiration, 50, 30, 0);
        }
        assert!(expiration > 3000);
    }

    #[test]
    fn test_extend_clamped_by_total_lifetime_cap() {
        // start 0, cap 100: extending an expiration of 90 stops at 100.
        assert_eq!(extended_expiration(0, 90, 50, 30, 100), 100);
        // And never regresses once the cap is reached.
        assert_eq!(extended_expiration(0, 100, 50, 30, 100), 100);
    }

    #[test]
    fn test_extend_property_gains_at_least_extension_when_unclamped() {
        for expiration in [10i64, 100, 1000] {
            for now in [0i64, 50, 500] {
                let result = extended_expiration(0, expiration, now, 30, 0);
                if expiration >= now {
                    assert_eq!(result, expiration + 30);
                }
            }
        }
    }
}
