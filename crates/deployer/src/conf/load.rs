//! Load — env-style file parsing, environment overrides, validation.
//!
//! Priority: process environment > env file. The whole snapshot is parsed
//! out of a flat key/value map so the loader itself is side-effect free.

use std::collections::HashMap;
use std::str::FromStr;

use thiserror::Error;

use super::model::{
    AdminConfig, DeployerConfig, LifetimeConfig, LimitsConfig, LoggingConfig, MaintenanceConfig,
    NetworkConfig, PortsConfig, QuotaConfig, RateLimitConfig, SecurityConfig, StoreConfig,
    RESERVED_PORTS,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration key: {0}")]
    MissingKey(&'static str),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
    #[error("port {port} ({key}) is a well-known service port and may not be used")]
    ReservedPort { key: &'static str, port: u16 },
    #[error("port ranges overlap: {0}")]
    PortConflict(String),
    #[error("failed to read env file {path}: {source}")]
    EnvFile {
        path: String,
        source: dotenvy::Error,
    },
}

impl DeployerConfig {
    /// Load the configuration snapshot.
    ///
    /// Reads the env file named by `DEPLOYER_ENV_FILE` (default `.env`,
    /// silently skipped when absent), then lets process environment
    /// variables override it, then validates.
    pub fn load() -> Result<Self, ConfigError> {
        let env_file =
            std::env::var("DEPLOYER_ENV_FILE").unwrap_or_else(|_| ".env".to_string());

        let mut vars: HashMap<String, String> = HashMap::new();
        match dotenvy::from_filename_iter(&env_file) {
            Ok(iter) => {
                for item in iter {
                    let (k, v) = item.map_err(|e| ConfigError::EnvFile {
                        path: env_file.clone(),
                        source: e,
                    })?;
                    vars.insert(k, v);
                }
                tracing::info!(path = %env_file, "Loaded env file");
            }
            Err(e) if e.not_found() => {
                tracing::info!(path = %env_file, "Env file not found, using process environment only");
            }
            Err(e) => {
                return Err(ConfigError::EnvFile {
                    path: env_file,
                    source: e,
                });
            }
        }

        // Process environment overrides file values.
        for (k, v) in std::env::vars() {
            vars.insert(k, v);
        }

        let config = Self::from_map(&vars)?;
        config.validate()?;
        Ok(config)
    }

    /// Build the snapshot from a flat key/value map. Does not validate.
    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let challenge_image = required(vars, "DEPLOYER_CHALLENGE_IMAGE")?;
        let config = DeployerConfig {
            challenge_name: optional(vars, "DEPLOYER_CHALLENGE_NAME")
                .unwrap_or_else(|| challenge_image.clone()),
            challenge_image,
            flag: required(vars, "DEPLOYER_FLAG")?,
            compose_project: parse_or(vars, "DEPLOYER_COMPOSE_PROJECT", "ctf-deployer".to_string())?,
            docker_socket: parse_or(vars, "DEPLOYER_DOCKER_SOCKET", String::new())?,
            lifetime: LifetimeConfig {
                default_lifetime_sec: parse_or(vars, "DEPLOYER_DEFAULT_LIFETIME_SEC", 3600i64)?,
                extension_sec: parse_or(vars, "DEPLOYER_EXTENSION_SEC", 1800i64)?,
                restart_preserves_expiration: parse_bool_or(
                    vars,
                    "DEPLOYER_RESTART_PRESERVES_EXPIRATION",
                    true,
                )?,
                extend_max_total_sec: parse_or(vars, "DEPLOYER_EXTEND_MAX_TOTAL_SEC", 0i64)?,
            },
            ports: PortsConfig {
                port_in_container: parse_required(vars, "DEPLOYER_PORT_IN_CONTAINER")?,
                start_range: parse_required(vars, "DEPLOYER_START_RANGE")?,
                stop_range: parse_required(vars, "DEPLOYER_STOP_RANGE")?,
                api_port: parse_or(vars, "DEPLOYER_API_PORT", 8000u16)?,
                direct_test_port: parse_or(vars, "DEPLOYER_DIRECT_TEST_PORT", 9999u16)?,
            },
            network: NetworkConfig {
                network_name: parse_or(vars, "DEPLOYER_NETWORK_NAME", "ctf_net".to_string())?,
                network_subnet: parse_or(
                    vars,
                    "DEPLOYER_NETWORK_SUBNET",
                    "172.28.0.0/16".to_string(),
                )?,
            },
            store: StoreConfig {
                host: parse_or(vars, "DEPLOYER_DB_HOST", "localhost".to_string())?,
                port: parse_or(vars, "DEPLOYER_DB_PORT", 5432u16)?,
                name: required(vars, "DEPLOYER_DB_NAME")?,
                user: required(vars, "DEPLOYER_DB_USER")?,
                password: required(vars, "DEPLOYER_DB_PASSWORD")?,
                pool_min: parse_or(vars, "DEPLOYER_DB_POOL_MIN", 2u32)?,
                pool_max: parse_or(vars, "DEPLOYER_DB_POOL_MAX", 10u32)?,
            },
            limits: LimitsConfig {
                per_container_mem: parse_or(
                    vars,
                    "DEPLOYER_PER_CONTAINER_MEM",
                    512 * 1024 * 1024i64,
                )?,
                per_container_swap: parse_or(
                    vars,
                    "DEPLOYER_PER_CONTAINER_SWAP",
                    512 * 1024 * 1024i64,
                )?,
                per_container_cpu: parse_or(vars, "DEPLOYER_PER_CONTAINER_CPU", 0.5f64)?,
                per_container_pids: parse_or(vars, "DEPLOYER_PER_CONTAINER_PIDS", 64i64)?,
            },
            security: SecurityConfig {
                no_new_privileges: parse_bool_or(vars, "DEPLOYER_NO_NEW_PRIVILEGES", true)?,
                read_only: parse_bool_or(vars, "DEPLOYER_READ_ONLY", true)?,
                tmpfs_enable: parse_bool_or(vars, "DEPLOYER_TMPFS_ENABLE", true)?,
                tmpfs_size: parse_or(vars, "DEPLOYER_TMPFS_SIZE", "64m".to_string())?,
                drop_all_caps: parse_bool_or(vars, "DEPLOYER_DROP_ALL_CAPS", true)?,
                cap_net_bind: parse_bool_or(vars, "DEPLOYER_CAP_NET_BIND", true)?,
                cap_chown: parse_bool_or(vars, "DEPLOYER_CAP_CHOWN", true)?,
            },
            rate_limit: RateLimitConfig {
                max_containers_per_source_per_window: parse_or(
                    vars,
                    "DEPLOYER_MAX_CONTAINERS_PER_SOURCE_PER_WINDOW",
                    5i64,
                )?,
                rate_limit_window_sec: parse_or(vars, "DEPLOYER_RATE_LIMIT_WINDOW_SEC", 3600i64)?,
            },
            maintenance: MaintenanceConfig {
                thread_pool_size: parse_or(vars, "DEPLOYER_THREAD_POOL_SIZE", 8usize)?,
                maintenance_interval_sec: parse_or(vars, "DEPLOYER_MAINTENANCE_INTERVAL_SEC", 60u64)?,
                container_check_interval_sec: parse_or(
                    vars,
                    "DEPLOYER_CONTAINER_CHECK_INTERVAL_SEC",
                    30u64,
                )?,
                captcha_ttl_sec: parse_or(vars, "DEPLOYER_CAPTCHA_TTL_SEC", 120i64)?,
                maintenance_batch_size: parse_or(vars, "DEPLOYER_MAINTENANCE_BATCH_SIZE", 50i64)?,
                maintenance_pool_min: parse_or(vars, "DEPLOYER_MAINTENANCE_POOL_MIN", 1u32)?,
                maintenance_pool_max: parse_or(vars, "DEPLOYER_MAINTENANCE_POOL_MAX", 5u32)?,
                port_allocation_max_attempts: parse_or(
                    vars,
                    "DEPLOYER_PORT_ALLOCATION_MAX_ATTEMPTS",
                    5u32,
                )?,
                stale_port_max_age: parse_or(vars, "DEPLOYER_STALE_PORT_MAX_AGE", 3600i64)?,
                operation_timeout_sec: parse_or(vars, "DEPLOYER_OPERATION_TIMEOUT_SEC", 30u64)?,
                lock_dir: parse_or(
                    vars,
                    "DEPLOYER_LOCK_DIR",
                    "/var/lock/ctf-deployer".to_string(),
                )?,
            },
            quotas: QuotaConfig {
                enable_resource_quotas: parse_bool_or(vars, "DEPLOYER_ENABLE_RESOURCE_QUOTAS", true)?,
                max_total_containers: parse_or(vars, "DEPLOYER_MAX_TOTAL_CONTAINERS", 100i64)?,
                max_total_cpu_percent: parse_or(vars, "DEPLOYER_MAX_TOTAL_CPU_PERCENT", 80.0f64)?,
                max_total_memory_bytes: parse_or(
                    vars,
                    "DEPLOYER_MAX_TOTAL_MEMORY_BYTES",
                    8 * 1024 * 1024 * 1024i64,
                )?,
                resource_check_interval_sec: parse_or(
                    vars,
                    "DEPLOYER_RESOURCE_CHECK_INTERVAL_SEC",
                    15u64,
                )?,
                resource_soft_limit_percent: parse_or(
                    vars,
                    "DEPLOYER_RESOURCE_SOFT_LIMIT_PERCENT",
                    80.0f64,
                )?,
            },
            admin: AdminConfig {
                admin_key: required(vars, "DEPLOYER_ADMIN_KEY")?,
                enable_metrics: parse_bool_or(vars, "DEPLOYER_ENABLE_METRICS", true)?,
                enable_logs_endpoint: parse_bool_or(vars, "DEPLOYER_ENABLE_LOGS_ENDPOINT", true)?,
                bypass_captcha: parse_bool_or(vars, "DEPLOYER_BYPASS_CAPTCHA", false)?,
            },
            logging: LoggingConfig {
                level: parse_or(vars, "DEPLOYER_LOG_LEVEL", "info,deployer=debug".to_string())?,
                format: parse_or(vars, "DEPLOYER_LOG_FORMAT", "pretty".to_string())?,
            },
        };
        Ok(config)
    }

    /// Validate cross-field invariants. Fails fast naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.start_range >= self.ports.stop_range {
            return Err(ConfigError::InvalidValue {
                key: "DEPLOYER_START_RANGE",
                reason: format!(
                    "start_range ({}) must be below stop_range ({})",
                    self.ports.start_range, self.ports.stop_range
                ),
            });
        }

        let named_ports: &[(&'static str, u16)] = &[
            ("DEPLOYER_API_PORT", self.ports.api_port),
            ("DEPLOYER_DIRECT_TEST_PORT", self.ports.direct_test_port),
            ("DEPLOYER_PORT_IN_CONTAINER", self.ports.port_in_container),
        ];
        for &(key, port) in named_ports {
            if RESERVED_PORTS.contains(&port) {
                return Err(ConfigError::ReservedPort { key, port });
            }
        }
        for &reserved in RESERVED_PORTS {
            if reserved >= self.ports.start_range && reserved < self.ports.stop_range {
                return Err(ConfigError::ReservedPort {
                    key: "DEPLOYER_START_RANGE",
                    port: reserved,
                });
            }
        }

        let range = self.ports.start_range..self.ports.stop_range;
        if range.contains(&self.ports.api_port) {
            return Err(ConfigError::PortConflict(format!(
                "api_port {} falls inside the allocation range [{}, {})",
                self.ports.api_port, self.ports.start_range, self.ports.stop_range
            )));
        }
        if range.contains(&self.ports.direct_test_port) {
            return Err(ConfigError::PortConflict(format!(
                "direct_test_port {} falls inside the allocation range [{}, {})",
                self.ports.direct_test_port, self.ports.start_range, self.ports.stop_range
            )));
        }

        if self.lifetime.default_lifetime_sec <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "DEPLOYER_DEFAULT_LIFETIME_SEC",
                reason: "must be > 0".to_string(),
            });
        }
        if self.lifetime.extension_sec <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "DEPLOYER_EXTENSION_SEC",
                reason: "must be > 0".to_string(),
            });
        }
        if self.store.pool_min > self.store.pool_max {
            return Err(ConfigError::InvalidValue {
                key: "DEPLOYER_DB_POOL_MIN",
                reason: format!(
                    "pool_min ({}) exceeds pool_max ({})",
                    self.store.pool_min, self.store.pool_max
                ),
            });
        }
        if self.maintenance.maintenance_pool_min > self.maintenance.maintenance_pool_max {
            return Err(ConfigError::InvalidValue {
                key: "DEPLOYER_MAINTENANCE_POOL_MIN",
                reason: format!(
                    "maintenance_pool_min ({}) exceeds maintenance_pool_max ({})",
                    self.maintenance.maintenance_pool_min, self.maintenance.maintenance_pool_max
                ),
            });
        }
        if self.maintenance.thread_pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DEPLOYER_THREAD_POOL_SIZE",
                reason: "must be > 0".to_string(),
            });
        }
        if self.maintenance.port_allocation_max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DEPLOYER_PORT_ALLOCATION_MAX_ATTEMPTS",
                reason: "must be > 0".to_string(),
            });
        }
        if self.limits.per_container_swap < self.limits.per_container_mem {
            return Err(ConfigError::InvalidValue {
                key: "DEPLOYER_PER_CONTAINER_SWAP",
                reason: "memory+swap limit must be at least the memory limit".to_string(),
            });
        }
        if self.rate_limit.max_containers_per_source_per_window <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "DEPLOYER_MAX_CONTAINERS_PER_SOURCE_PER_WINDOW",
                reason: "must be > 0".to_string(),
            });
        }
        if self.admin.admin_key.len() < 8 {
            return Err(ConfigError::InvalidValue {
                key: "DEPLOYER_ADMIN_KEY",
                reason: "must be at least 8 characters".to_string(),
            });
        }
        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "DEPLOYER_LOG_FORMAT",
                    reason: format!("expected \"pretty\" or \"json\", got \"{}\"", other),
                });
            }
        }
        Ok(())
    }
}

fn required(vars: &HashMap<String, String>, key: &'static str) -> Result<String, ConfigError> {
    match vars.get(key) {
        Some(v) if !v.trim().is_empty() => Ok(v.clone()),
        _ => Err(ConfigError::MissingKey(key)),
    }
}

fn optional(vars: &HashMap<String, String>, key: &str) -> Option<String> {
    vars.get(key).filter(|v| !v.trim().is_empty()).cloned()
}

fn parse_required<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &'static str,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    let raw = required(vars, key)?;
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key,
        reason: format!("{} ({:?})", e, raw),
    })
}

fn parse_or<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match optional(vars, key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            reason: format!("{} ({:?})", e, raw),
        }),
        None => Ok(default),
    }
}

/// Booleans are accepted as `"true"` / `"false"`, case-insensitively.
fn parse_bool_or(
    vars: &HashMap<String, String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match optional(vars, key) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                key,
                reason: format!("expected \"true\" or \"false\", got \"{}\"", other),
            }),
        },
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_vars() -> HashMap<String, String> {
        let mut vars = HashMap::new();
        for (k, v) in [
            ("DEPLOYER_CHALLENGE_IMAGE", "ctf/challenge:latest"),
            ("DEPLOYER_FLAG", "flag{test}"),
            ("DEPLOYER_ADMIN_KEY", "super-secret-key"),
            ("DEPLOYER_DB_NAME", "ctf"),
            ("DEPLOYER_DB_USER", "ctf"),
            ("DEPLOYER_DB_PASSWORD", "hunter2hunter2"),
            ("DEPLOYER_PORT_IN_CONTAINER", "1337"),
            ("DEPLOYER_START_RANGE", "9000"),
            ("DEPLOYER_STOP_RANGE", "9100"),
        ] {
            vars.insert(k.to_string(), v.to_string());
        }
        vars
    }

    #[test]
    fn test_minimal_config_loads_with_defaults() {
        let config = DeployerConfig::from_map(&minimal_vars()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.lifetime.default_lifetime_sec, 3600);
        assert_eq!(config.ports.pool_size(), 100);
        assert_eq!(config.store.pool_max, 10);
        assert!(config.lifetime.restart_preserves_expiration);
        assert_eq!(config.challenge_name, "ctf/challenge:latest");
        assert!(!config.admin.bypass_captcha);
    }

    #[test]
    fn test_missing_required_key_is_named() {
        let mut vars = minimal_vars();
        vars.remove("DEPLOYER_ADMIN_KEY");
        let err = DeployerConfig::from_map(&vars).unwrap_err();
        assert!(err.to_string().contains("DEPLOYER_ADMIN_KEY"));
    }

    #[test]
    fn test_bool_parsing_case_insensitive() {
        let mut vars = minimal_vars();
        vars.insert("DEPLOYER_BYPASS_CAPTCHA".to_string(), "TRUE".to_string());
        vars.insert("DEPLOYER_READ_ONLY".to_string(), "False".to_string());
        let config = DeployerConfig::from_map(&vars).unwrap();
        assert!(config.admin.bypass_captcha);
        assert!(!config.security.read_only);
    }

    #[test]
    fn test_bool_parsing_rejects_garbage() {
        let mut vars = minimal_vars();
        vars.insert("DEPLOYER_BYPASS_CAPTCHA".to_string(), "yes".to_string());
        let err = DeployerConfig::from_map(&vars).unwrap_err();
        assert!(err.to_string().contains("DEPLOYER_BYPASS_CAPTCHA"));
    }

    #[test]
    fn test_inverted_range_rejected() {
        let mut vars = minimal_vars();
        vars.insert("DEPLOYER_START_RANGE".to_string(), "9100".to_string());
        vars.insert("DEPLOYER_STOP_RANGE".to_string(), "9000".to_string());
        let config = DeployerConfig::from_map(&vars).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("start_range"));
    }

    #[test]
    fn test_reserved_port_rejected_in_api_port() {
        let mut vars = minimal_vars();
        vars.insert("DEPLOYER_API_PORT".to_string(), "5432".to_string());
        let config = DeployerConfig::from_map(&vars).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::ReservedPort { port: 5432, .. }));
    }

    #[test]
    fn test_reserved_port_rejected_inside_range() {
        let mut vars = minimal_vars();
        vars.insert("DEPLOYER_START_RANGE".to_string(), "8000".to_string());
        vars.insert("DEPLOYER_STOP_RANGE".to_string(), "8100".to_string());
        let config = DeployerConfig::from_map(&vars).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::ReservedPort { port: 8080, .. }));
    }

    #[test]
    fn test_api_port_inside_allocation_range_rejected() {
        let mut vars = minimal_vars();
        vars.insert("DEPLOYER_API_PORT".to_string(), "9050".to_string());
        let config = DeployerConfig::from_map(&vars).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::PortConflict(_)));
    }

    #[test]
    fn test_swap_below_mem_rejected() {
        let mut vars = minimal_vars();
        vars.insert("DEPLOYER_PER_CONTAINER_MEM".to_string(), "1000".to_string());
        vars.insert("DEPLOYER_PER_CONTAINER_SWAP".to_string(), "500".to_string());
        let config = DeployerConfig::from_map(&vars).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_round_trips_through_serde() {
        let config = DeployerConfig::from_map(&minimal_vars()).unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let back: DeployerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ports.start_range, config.ports.start_range);
        assert_eq!(back.store.url(), config.store.url());
        assert_eq!(back.flag, config.flag);
    }

    #[test]
    fn test_nano_cpus_conversion() {
        let mut vars = minimal_vars();
        vars.insert("DEPLOYER_PER_CONTAINER_CPU".to_string(), "0.25".to_string());
        let config = DeployerConfig::from_map(&vars).unwrap();
        assert_eq!(config.limits.nano_cpus(), 250_000_000);
    }
}
