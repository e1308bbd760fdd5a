//! Prometheus registry for the deployer's metric series.
//!
//! Every series lives on a dedicated registry so the text exposition on
//! `/metrics` contains exactly the deployer's own metrics.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

pub struct DeployerMetrics {
    registry: Registry,

    pub info: IntGaugeVec,
    pub active_containers: IntGauge,
    pub deployments_total: IntCounter,
    pub deployment_duration: Histogram,
    pub container_lifetime: Histogram,
    pub rate_limit_checks_total: IntCounter,
    pub rate_limit_rejections_total: IntCounter,
    pub resource_quota_checks_total: IntCounter,
    pub resource_quota_rejections_total: IntCounterVec,
    pub resource_usage_percent: prometheus::GaugeVec,
    pub resource_current: prometheus::GaugeVec,
    pub resource_limit: prometheus::GaugeVec,
    pub errors_total: IntCounterVec,
    pub database_operations_total: IntCounterVec,
    pub database_operation_duration: Histogram,
    pub database_connection_pool: IntGaugeVec,
    pub port_pool: IntGaugeVec,
    pub port_allocation_failures_total: IntCounter,
}

impl DeployerMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let info = IntGaugeVec::new(
            Opts::new("ctf_deployer_info", "Build information for the deployer"),
            &["version"],
        )
        .unwrap();
        let active_containers = IntGauge::new(
            "ctf_active_containers",
            "Number of challenge containers currently running",
        )
        .unwrap();
        let deployments_total = IntCounter::new(
            "ctf_container_deployments_total",
            "Successful challenge deployments since start",
        )
        .unwrap();
        let deployment_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ctf_container_deployment_duration_seconds",
                "Wall-clock time of a successful deploy operation",
            )
            .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )
        .unwrap();
        let container_lifetime = Histogram::with_opts(
            HistogramOpts::new(
                "ctf_container_lifetime_seconds",
                "Observed lifetime of reclaimed challenge containers",
            )
            .buckets(vec![60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0, 14400.0]),
        )
        .unwrap();
        let rate_limit_checks_total = IntCounter::new(
            "ctf_rate_limit_checks_total",
            "Rate-limit admission checks performed",
        )
        .unwrap();
        let rate_limit_rejections_total = IntCounter::new(
            "ctf_rate_limit_rejections_total",
            "Deploy requests rejected by the rate limiter",
        )
        .unwrap();
        let resource_quota_checks_total = IntCounter::new(
            "ctf_resource_quota_checks_total",
            "Resource-quota admission checks performed",
        )
        .unwrap();
        let resource_quota_rejections_total = IntCounterVec::new(
            Opts::new(
                "ctf_resource_quota_rejections_total",
                "Deploy requests rejected by resource quotas",
            ),
            &["resource"],
        )
        .unwrap();
        let resource_usage_percent = prometheus::GaugeVec::new(
            Opts::new(
                "ctf_resource_usage_percent",
                "Current usage of a resource class as a percentage of its limit",
            ),
            &["resource"],
        )
        .unwrap();
        let resource_current = prometheus::GaugeVec::new(
            Opts::new("ctf_resource_current", "Current usage of a resource class"),
            &["resource"],
        )
        .unwrap();
        let resource_limit = prometheus::GaugeVec::new(
            Opts::new("ctf_resource_limit", "Configured limit of a resource class"),
            &["resource"],
        )
        .unwrap();
        let errors_total = IntCounterVec::new(
            Opts::new("ctf_errors_total", "Errors by class"),
            &["type"],
        )
        .unwrap();
        let database_operations_total = IntCounterVec::new(
            Opts::new("ctf_database_operations_total", "Store operations by name"),
            &["op"],
        )
        .unwrap();
        let database_operation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ctf_database_operation_duration_seconds",
                "Latency of store operations",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .unwrap();
        let database_connection_pool = IntGaugeVec::new(
            Opts::new(
                "ctf_database_connection_pool",
                "Connection pool occupancy by state",
            ),
            &["state"],
        )
        .unwrap();
        let port_pool = IntGaugeVec::new(
            Opts::new("ctf_port_pool", "Port pool occupancy by state"),
            &["state"],
        )
        .unwrap();
        let port_allocation_failures_total = IntCounter::new(
            "ctf_port_allocation_failures_total",
            "Reservation attempts that exhausted the pool or retries",
        )
        .unwrap();

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(info.clone()),
            Box::new(active_containers.clone()),
            Box::new(deployments_total.clone()),
            Box::new(deployment_duration.clone()),
            Box::new(container_lifetime.clone()),
            Box::new(rate_limit_checks_total.clone()),
            Box::new(rate_limit_rejections_total.clone()),
            Box::new(resource_quota_checks_total.clone()),
            Box::new(resource_quota_rejections_total.clone()),
            Box::new(resource_usage_percent.clone()),
            Box::new(resource_current.clone()),
            Box::new(resource_limit.clone()),
            Box::new(errors_total.clone()),
            Box::new(database_operations_total.clone()),
            Box::new(database_operation_duration.clone()),
            Box::new(database_connection_pool.clone()),
            Box::new(port_pool.clone()),
            Box::new(port_allocation_failures_total.clone()),
        ];
        for metric in collectors {
            registry.register(metric).unwrap();
        }

        info.with_label_values(&[env!("CARGO_PKG_VERSION")]).set(1);

        Self {
            registry,
            info,
            active_containers,
            deployments_total,
            deployment_duration,
            container_lifetime,
            rate_limit_checks_total,
            rate_limit_rejections_total,
            resource_quota_checks_total,
            resource_quota_rejections_total,
            resource_usage_percent,
            resource_current,
            resource_limit,
            errors_total,
            database_operations_total,
            database_operation_duration,
            database_connection_pool,
            port_pool,
            port_allocation_failures_total,
        }
    }

    /// Record a user-visible error on `ctf_errors_total{type}`.
    pub fn record_error(&self, err: &crate::error::DeployError) {
        self.errors_total
            .with_label_values(&[err.metric_label()])
            .inc();
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buf) {
            tracing::error!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl Default for DeployerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeployError;

    #[test]
    fn test_all_series_present_in_exposition() {
        let metrics = DeployerMetrics::new();
        metrics.deployments_total.inc();
        metrics.active_containers.set(3);
        metrics
            .resource_usage_percent
            .with_label_values(&["cpu"])
            .set(12.5);
        metrics
            .database_operations_total
            .with_label_values(&["insert_container"])
            .inc();
        metrics.port_pool.with_label_values(&["free"]).set(99);

        let text = metrics.gather();
        for name in [
            "ctf_deployer_info",
            "ctf_active_containers",
            "ctf_container_deployments_total",
            "ctf_resource_usage_percent",
            "ctf_database_operations_total",
            "ctf_port_pool",
        ] {
            assert!(text.contains(name), "missing series {} in:\n{}", name, text);
        }
    }

    #[test]
    fn test_error_recording_uses_type_label() {
        let metrics = DeployerMetrics::new();
        metrics.record_error(&DeployError::RateLimited);
        metrics.record_error(&DeployError::RateLimited);
        let text = metrics.gather();
        assert!(text.contains("ctf_errors_total{type=\"rate_limited\"} 2"));
    }

    #[test]
    fn test_info_carries_version_label() {
        let metrics = DeployerMetrics::new();
        let text = metrics.gather();
        assert!(text.contains(&format!("version=\"{}\"", env!("CARGO_PKG_VERSION"))));
    }
}
