//! The deploy pipeline — staged admission, then provision with unwinding.
//!
//! Admission order: captcha → rate limit → existing-instance → quota.
//! Only after all four pass does the pipeline reserve resources; from that
//! point every failure releases whatever was already claimed before the
//! error surfaces.

use uuid::Uuid;

use super::{DeployedInstance, Orchestrator};
use crate::docker::ChallengeSpec;
use crate::error::DeployError;
use crate::store::containers::{ContainerRow, ContainerStatus};

impl Orchestrator {
    /// Deploy one instance for `user_uuid` from `ip`.
    pub async fn deploy(
        &self,
        user_uuid: &str,
        ip: &str,
        captcha_id: &str,
        captcha_answer: &str,
    ) -> Result<DeployedInstance, DeployError> {
        let timer = self.metrics.deployment_duration.start_timer();
        let result = self
            .bounded(
                "deploy",
                self.deploy_inner(user_uuid, ip, captcha_id, captcha_answer),
            )
            .await;
        match &result {
            Ok(instance) => {
                timer.observe_duration();
                self.metrics.deployments_total.inc();
                tracing::info!(
                    container_id = %instance.container_id,
                    user_uuid = %user_uuid,
                    ip = %ip,
                    port = instance.port,
                    "Instance deployed"
                );
            }
            Err(_) => {
                timer.stop_and_discard();
            }
        }
        result
    }

    async fn deploy_inner(
        &self,
        user_uuid: &str,
        ip: &str,
        captcha_id: &str,
        captcha_answer: &str,
    ) -> Result<DeployedInstance, DeployError> {
        let now = chrono::Utc::now().timestamp();

        if !self.captcha.verify(captcha_id, captcha_answer, now) {
            return Err(DeployError::CaptchaInvalid);
        }

        self.limiter.admit(ip, now).await?;

        if self.store.running_for_user(user_uuid).await?.is_some() {
            return Err(DeployError::AlreadyOwns);
        }

        self.resources.admit(1)?;

        let expiration = now + self.config.lifetime.default_lifetime_sec;
        self.provision(user_uuid, ip, now, expiration).await
    }

    /// Reserve a port, create the engine container, persist the row, and
    /// schedule the monitor. Shared by Deploy and Restart.
    ///
    /// Unwinding: an engine failure releases the port; a store failure
    /// force-removes the engine container and releases the port; a rebind
    /// failure is left for the janitor (the row is already authoritative).
    pub(super) async fn provision(
        &self,
        user_uuid: &str,
        ip: &str,
        now: i64,
        expiration_time: i64,
    ) -> Result<DeployedInstance, DeployError> {
        // The port row needs an owner before the engine assigns the real
        // id; the placeholder is rebound once the container exists.
        let placeholder = format!("pending-{}", Uuid::new_v4());
        let port = self.ports.reserve(&placeholder, now).await?;

        let spec = ChallengeSpec::from_config(&self.config, port);
        let container_id = match self.docker.run_challenge(&spec).await {
            Ok(id) => id,
            Err(e) => {
                self.release_quietly(port).await;
                return Err(e.into());
            }
        };

        let row = ContainerRow {
            id: container_id.clone(),
            port: port as i32,
            start_time: now,
            expiration_time,
            user_uuid: user_uuid.to_string(),
            ip_address: ip.to_string(),
            status: ContainerStatus::Running.as_str().to_string(),
        };

        if let Err(e) = self.store.insert_container(&row).await {
            tracing::error!(
                container_id = %container_id,
                error = %e,
                "Store insert failed after engine create, unwinding"
            );
            if let Err(cleanup) = self.remove_engine_container(&container_id).await {
                tracing::error!(
                    container_id = %container_id,
                    error = %cleanup,
                    "Unwind could not remove engine container"
                );
            }
            self.release_quietly(port).await;
            return Err(e.into());
        }

        if let Err(e) = self.ports.rebind(port, &container_id).await {
            // The container row is authoritative; the sweeper reconciles
            // the placeholder reservation once it ages out.
            tracing::warn!(
                container_id = %container_id,
                port = port,
                error = %e,
                "Port rebind failed, leaving reconciliation to the janitor"
            );
        }

        self.monitors.register(&container_id);
        self.expiry.schedule(expiration_time, &container_id);

        Ok(DeployedInstance {
            container_id,
            port,
            expiration_time,
        })
    }

    async fn release_quietly(&self, port: u16) {
        if let Err(e) = self.ports.release(port).await {
            tracing::error!(
                port = port,
                error = %e,
                "Unwind could not release port reservation"
            );
        }
    }
}
