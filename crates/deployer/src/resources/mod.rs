//! Resource monitor — global quota tracking and admission.
//!
//! A background task (see [`monitor`]) refreshes a read-mostly snapshot of
//! usage per resource class; admission decisions project against the most
//! recent snapshot rather than querying live, so a deploy never waits on
//! engine stats.

pub mod monitor;

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::conf::QuotaConfig;
use crate::error::DeployError;
use crate::metrics::DeployerMetrics;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ResourceClass {
    pub current: f64,
    pub limit: f64,
}

impl ResourceClass {
    pub fn percent(&self) -> f64 {
        if self.limit > 0.0 {
            (self.current / self.limit) * 100.0
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ResourceSnapshot {
    pub containers: ResourceClass,
    pub cpu: ResourceClass,
    pub memory: ResourceClass,
    pub ports: ResourceClass,
    pub last_updated: i64,
}

impl ResourceSnapshot {
    fn empty(config: &QuotaConfig, port_pool_size: u16) -> Self {
        Self {
            containers: ResourceClass {
                current: 0.0,
                limit: config.max_total_containers as f64,
            },
            cpu: ResourceClass {
                current: 0.0,
                limit: config.max_total_cpu_percent,
            },
            memory: ResourceClass {
                current: 0.0,
                limit: config.max_total_memory_bytes as f64,
            },
            ports: ResourceClass {
                current: 0.0,
                limit: port_pool_size as f64,
            },
            last_updated: 0,
        }
    }
}

pub struct ResourceMonitor {
    config: QuotaConfig,
    snapshot: RwLock<ResourceSnapshot>,
    metrics: Arc<DeployerMetrics>,
}

impl ResourceMonitor {
    pub fn new(config: QuotaConfig, port_pool_size: u16, metrics: Arc<DeployerMetrics>) -> Self {
        let snapshot = ResourceSnapshot::empty(&config, port_pool_size);
        Self {
            config,
            snapshot: RwLock::new(snapshot),
            metrics,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enable_resource_quotas
    }

    pub fn check_interval_sec(&self) -> u64 {
        self.config.resource_check_interval_sec
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        *self.snapshot.read()
    }

    /// Replace the snapshot and refresh the exported gauges.
    pub fn update(&self, snapshot: ResourceSnapshot) {
        for (name, class) in [
            ("containers", &snapshot.containers),
            ("cpu", &snapshot.cpu),
            ("memory", &snapshot.memory),
            ("ports", &snapshot.ports),
        ] {
            self.metrics
                .resource_current
                .with_label_values(&[name])
                .set(class.current);
            self.metrics
                .resource_limit
                .with_label_values(&[name])
                .set(class.limit);
            self.metrics
                .resource_usage_percent
                .with_label_values(&[name])
                .set(class.percent());

            if class.percent() >= self.config.resource_soft_limit_percent
                && class.percent() < 100.0
            {
                tracing::warn!(
                    resource = name,
                    percent = format!("{:.1}", class.percent()),
                    "Resource approaching its quota"
                );
            }
        }
        *self.snapshot.write() = snapshot;
    }

    /// Admission check before creating `expected_delta` more containers.
    ///
    /// Projects the latest snapshot; the store-backed checks downstream
    /// (port reservation, unique running row) remain authoritative.
    pub fn admit(&self, expected_delta: i64) -> Result<(), DeployError> {
        if !self.config.enable_resource_quotas {
            return Ok(());
        }
        self.metrics.resource_quota_checks_total.inc();

        let snapshot = self.snapshot();
        let projections: [(&str, f64, f64); 4] = [
            (
                "containers",
                snapshot.containers.current + expected_delta as f64,
                snapshot.containers.limit,
            ),
            ("cpu", snapshot.cpu.current, snapshot.cpu.limit),
            ("memory", snapshot.memory.current, snapshot.memory.limit),
            (
                "ports",
                snapshot.ports.current + expected_delta as f64,
                snapshot.ports.limit,
            ),
        ];

        for (resource, projected, limit) in projections {
            if projected > limit {
                self.metrics
                    .resource_quota_rejections_total
                    .with_label_values(&[resource])
                    .inc();
                return Err(DeployError::QuotaExceeded {
                    resource: resource.to_string(),
                    current: projected,
                    limit,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quota_config(enabled: bool) -> QuotaConfig {
        QuotaConfig {
            enable_resource_quotas: enabled,
            max_total_containers: 10,
            max_total_cpu_percent: 80.0,
            max_total_memory_bytes: 1_000_000,
            resource_check_interval_sec: 15,
            resource_soft_limit_percent: 80.0,
        }
    }

    fn monitor(enabled: bool) -> ResourceMonitor {
        ResourceMonitor::new(
            quota_config(enabled),
            100,
            Arc::new(DeployerMetrics::new()),
        )
    }

    fn snapshot_with(containers: f64, cpu: f64, memory: f64, ports: f64) -> ResourceSnapshot {
        ResourceSnapshot {
            containers: ResourceClass {
                current: containers,
                limit: 10.0,
            },
            cpu: ResourceClass {
                current: cpu,
                limit: 80.0,
            },
            memory: ResourceClass {
                current: memory,
                limit: 1_000_000.0,
            },
            ports: ResourceClass {
                current: ports,
                limit: 100.0,
            },
            last_updated: 1234,
        }
    }

    #[test]
    fn test_admit_when_under_all_limits() {
        let m = monitor(true);
        m.update(snapshot_with(3.0, 10.0, 1000.0, 3.0));
        assert!(m.admit(1).is_ok());
    }

    #[test]
    fn test_reject_on_container_quota() {
        let m = monitor(true);
        m.update(snapshot_with(10.0, 0.0, 0.0, 10.0));
        let err = m.admit(1).unwrap_err();
        match err {
            DeployError::QuotaExceeded { resource, .. } => assert_eq!(resource, "containers"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_reject_on_cpu_quota() {
        let m = monitor(true);
        m.update(snapshot_with(1.0, 95.0, 0.0, 1.0));
        let err = m.admit(1).unwrap_err();
        match err {
            DeployError::QuotaExceeded { resource, .. } => assert_eq!(resource, "cpu"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_disabled_quotas_admit_everything() {
        let m = monitor(false);
        m.update(snapshot_with(1000.0, 1000.0, f64::MAX, 1000.0));
        assert!(m.admit(100).is_ok());
    }

    #[test]
    fn test_exact_limit_admits_projection_at_limit() {
        // 9 running, limit 10: projecting +1 lands exactly on the limit,
        // which is allowed; +2 is not.
        let m = monitor(true);
        m.update(snapshot_with(9.0, 0.0, 0.0, 9.0));
        assert!(m.admit(1).is_ok());
        assert!(m.admit(2).is_err());
    }

    #[test]
    fn test_percent_handles_zero_limit() {
        let class = ResourceClass {
            current: 5.0,
            limit: 0.0,
        };
        assert_eq!(class.percent(), 0.0);
    }
}
