//! Shared application state — one `Arc` handed to every handler and task.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::captcha::{ArithmeticScheme, CaptchaBroker};
use crate::conf::DeployerConfig;
use crate::docker::DockerClient;
use crate::janitor::{ExpiryQueue, Monitors};
use crate::limiter::RateLimiter;
use crate::metrics::DeployerMetrics;
use crate::orchestrator::Orchestrator;
use crate::ports::PortAllocator;
use crate::resources::ResourceMonitor;
use crate::store::Store;

pub struct AppState {
    pub config: Arc<DeployerConfig>,
    pub store: Arc<Store>,
    pub docker: DockerClient,
    pub ports: Arc<PortAllocator>,
    pub limiter: Arc<RateLimiter>,
    pub resources: Arc<ResourceMonitor>,
    pub captcha: Arc<CaptchaBroker>,
    pub metrics: Arc<DeployerMetrics>,
    pub orchestrator: Orchestrator,
    pub expiry: Arc<ExpiryQueue>,
    pub monitors: Arc<Monitors>,
    /// Cancelled on shutdown; background tasks select on it.
    pub shutdown: CancellationToken,
    pub started_at: i64,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire every component together. The store must already be connected
    /// and migrated, and shares the same metrics registry.
    pub fn new(
        config: DeployerConfig,
        store: Store,
        docker: DockerClient,
        metrics: Arc<DeployerMetrics>,
    ) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(store);

        let ports = Arc::new(PortAllocator::new(
            store.clone(),
            metrics.clone(),
            config.maintenance.port_allocation_max_attempts,
        ));
        let limiter = Arc::new(RateLimiter::new(
            store.clone(),
            metrics.clone(),
            &config.rate_limit,
        ));
        let resources = Arc::new(ResourceMonitor::new(
            config.quotas.clone(),
            config.ports.pool_size(),
            metrics.clone(),
        ));
        let captcha = Arc::new(CaptchaBroker::new(
            Box::new(ArithmeticScheme),
            config.maintenance.captcha_ttl_sec,
            config.admin.bypass_captcha,
        ));
        let expiry = Arc::new(ExpiryQueue::new());
        let monitors = Arc::new(Monitors::new());

        let orchestrator = Orchestrator::new(
            config.clone(),
            store.clone(),
            docker.clone(),
            ports.clone(),
            limiter.clone(),
            resources.clone(),
            captcha.clone(),
            metrics.clone(),
            expiry.clone(),
            monitors.clone(),
        );

        Self {
            config,
            store,
            docker,
            ports,
            limiter,
            resources,
            captcha,
            metrics,
            orchestrator,
            expiry,
            monitors,
            shutdown: CancellationToken::new(),
            started_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Signal all background tasks to stop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// A fully wired state for router tests: lazy store pool, default engine
/// client, fixed admin key. Nothing external is contacted at build time.
#[cfg(test)]
pub(crate) fn test_state() -> SharedState {
    use std::collections::HashMap;

    let mut vars = HashMap::new();
    for (k, v) in [
        ("DEPLOYER_CHALLENGE_IMAGE", "ctf/challenge:test"),
        ("DEPLOYER_FLAG", "flag{test}"),
        ("DEPLOYER_ADMIN_KEY", "test-admin-key"),
        ("DEPLOYER_DB_NAME", "ctf_test"),
        ("DEPLOYER_DB_USER", "ctf"),
        ("DEPLOYER_DB_PASSWORD", "unused"),
        ("DEPLOYER_PORT_IN_CONTAINER", "1337"),
        ("DEPLOYER_START_RANGE", "9000"),
        ("DEPLOYER_STOP_RANGE", "9010"),
    ] {
        vars.insert(k.to_string(), v.to_string());
    }
    let config = DeployerConfig::from_map(&vars).expect("test config");

    let metrics = Arc::new(DeployerMetrics::new());
    let store = Store::connect_lazy_for_tests(&config.store.url(), metrics.clone());
    let docker = DockerClient::new("").expect("docker client");

    Arc::new(AppState::new(config, store, docker, metrics))
}
