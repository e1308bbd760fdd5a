//! Configuration model — nested field groups, one struct per concern.

use serde::{Deserialize, Serialize};

/// Well-known service ports that must never appear in the API, direct-test,
/// in-container, or allocation-range settings.
pub const RESERVED_PORTS: &[u16] = &[
    22, 25, 53, 80, 110, 143, 443, 465, 587, 993, 995, 3306, 5432, 6379, 8080, 27017,
];

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeployerConfig {
    pub challenge_image: String,
    /// Display name for the challenge, shown on `/status`.
    pub challenge_name: String,
    /// Value injected into the container as the `FLAG` environment variable.
    pub flag: String,
    /// Compose project label used to enumerate deployment containers.
    pub compose_project: String,
    /// Docker socket path; empty string means the bollard defaults.
    pub docker_socket: String,
    pub lifetime: LifetimeConfig,
    pub ports: PortsConfig,
    pub network: NetworkConfig,
    pub store: StoreConfig,
    pub limits: LimitsConfig,
    pub security: SecurityConfig,
    pub rate_limit: RateLimitConfig,
    pub maintenance: MaintenanceConfig,
    pub quotas: QuotaConfig,
    pub admin: AdminConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LifetimeConfig {
    pub default_lifetime_sec: i64,
    pub extension_sec: i64,
    /// Whether Restart keeps the original expiration (true) or grants a
    /// fresh lifetime window (false).
    pub restart_preserves_expiration: bool,
    /// Cap on total lifetime (`expiration_time - start_time`) reachable
    /// through Extend. `0` disables the cap.
    pub extend_max_total_sec: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PortsConfig {
    /// Port the challenge listens on inside its container.
    pub port_in_container: u16,
    /// Half-open host-port allocation range `[start_range, stop_range)`.
    pub start_range: u16,
    pub stop_range: u16,
    pub api_port: u16,
    /// Host port of the reference challenge instance used for smoke tests.
    pub direct_test_port: u16,
}

impl PortsConfig {
    pub fn pool_size(&self) -> u16 {
        self.stop_range.saturating_sub(self.start_range)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    pub network_name: String,
    pub network_subnet: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub pool_min: u32,
    pub pool_max: u32,
}

impl StoreConfig {
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    /// Per-container memory limit, bytes.
    pub per_container_mem: i64,
    /// Per-container memory+swap limit, bytes. Equal to `per_container_mem`
    /// disables swap.
    pub per_container_swap: i64,
    /// Per-container CPU allowance, fractional cores.
    pub per_container_cpu: f64,
    pub per_container_pids: i64,
}

impl LimitsConfig {
    /// Docker expresses the CPU allowance in units of 10^-9 cores.
    pub fn nano_cpus(&self) -> i64 {
        (self.per_container_cpu * 1_000_000_000.0) as i64
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecurityConfig {
    pub no_new_privileges: bool,
    pub read_only: bool,
    pub tmpfs_enable: bool,
    pub tmpfs_size: String,
    pub drop_all_caps: bool,
    pub cap_net_bind: bool,
    pub cap_chown: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    pub max_containers_per_source_per_window: i64,
    pub rate_limit_window_sec: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MaintenanceConfig {
    /// Upper bound on concurrent reclamation workers.
    pub thread_pool_size: usize,
    pub maintenance_interval_sec: u64,
    /// Fallback re-check period for the expiry dispatcher.
    pub container_check_interval_sec: u64,
    pub captcha_ttl_sec: i64,
    pub maintenance_batch_size: i64,
    pub maintenance_pool_min: u32,
    pub maintenance_pool_max: u32,
    pub port_allocation_max_attempts: u32,
    /// Reservations older than this with no running owner are reclaimable.
    pub stale_port_max_age: i64,
    /// Per-operation deadline for orchestrator calls.
    pub operation_timeout_sec: u64,
    /// Directory holding the instance lock file.
    pub lock_dir: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuotaConfig {
    pub enable_resource_quotas: bool,
    pub max_total_containers: i64,
    pub max_total_cpu_percent: f64,
    pub max_total_memory_bytes: i64,
    pub resource_check_interval_sec: u64,
    /// Percentage at which a warning is logged before hard rejection.
    pub resource_soft_limit_percent: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdminConfig {
    pub admin_key: String,
    pub enable_metrics: bool,
    pub enable_logs_endpoint: bool,
    /// Test mode: captcha verification always succeeds.
    pub bypass_captcha: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" or "json".
    pub format: String,
}
