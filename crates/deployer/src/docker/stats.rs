//! Resource statistics — one-shot cpu% / memory snapshots per container.

use bollard::query_parameters::StatsOptions;
use tokio_stream::StreamExt;

use super::client::{classify, DockerClient, DriverError};

/// One container's instantaneous resource usage.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerUsage {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

impl DockerClient {
    /// Single stats snapshot for one container.
    pub async fn usage_once(&self, container_id: &str) -> Result<ContainerUsage, DriverError> {
        let options = StatsOptions {
            stream: false,
            ..Default::default()
        };
        let mut stream = self.client.stats(container_id, Some(options));

        match stream.next().await {
            Some(Ok(stats)) => Ok(ContainerUsage {
                cpu_percent: calculate_cpu_percentage(&stats),
                memory_bytes: stats
                    .memory_stats
                    .as_ref()
                    .and_then(|m| m.usage)
                    .unwrap_or(0),
            }),
            Some(Err(e)) => Err(classify(e)),
            None => Ok(ContainerUsage::default()),
        }
    }
}

/// CPU usage as a percentage of the host, from consecutive counter reads.
fn calculate_cpu_percentage(stats: &bollard::models::ContainerStatsResponse) -> f64 {
    let cpu_stats = match &stats.cpu_stats {
        Some(cpu) => cpu,
        None => return 0.0,
    };
    let precpu_stats = match &stats.precpu_stats {
        Some(precpu) => precpu,
        None => return 0.0,
    };

    let cpu_total = cpu_stats
        .cpu_usage
        .as_ref()
        .and_then(|u| u.total_usage)
        .unwrap_or(0);
    let precpu_total = precpu_stats
        .cpu_usage
        .as_ref()
        .and_then(|u| u.total_usage)
        .unwrap_or(0);

    // Saturating subtraction: if the counter resets (container restart),
    // the delta is 0.
    let cpu_delta = cpu_total.saturating_sub(precpu_total) as f64;

    let sys_current = cpu_stats.system_cpu_usage.unwrap_or(0);
    let sys_previous = precpu_stats.system_cpu_usage.unwrap_or(0);
    let system_delta = sys_current.saturating_sub(sys_previous) as f64;

    if system_delta > 0.0 && cpu_delta > 0.0 {
        let num_cpus = cpu_stats.online_cpus.unwrap_or(1).max(1) as f64;
        let pct = (cpu_delta / system_delta) * num_cpus * 100.0;
        if pct.is_finite() {
            pct
        } else {
            0.0
        }
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerCpuStats, ContainerCpuUsage, ContainerStatsResponse};

    fn stats_with(cpu_total: u64, precpu_total: u64, sys: u64, presys: u64) -> ContainerStatsResponse {
        ContainerStatsResponse {
            cpu_stats: Some(ContainerCpuStats {
                cpu_usage: Some(ContainerCpuUsage {
                    total_usage: Some(cpu_total),
                    ..Default::default()
                }),
                system_cpu_usage: Some(sys),
                online_cpus: Some(2),
                ..Default::default()
            }),
            precpu_stats: Some(ContainerCpuStats {
                cpu_usage: Some(ContainerCpuUsage {
                    total_usage: Some(precpu_total),
                    ..Default::default()
                }),
                system_cpu_usage: Some(presys),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_cpu_percentage_basic() {
        // 10 units of container time over 100 units of system time on 2 CPUs.
        let stats = stats_with(110, 100, 1100, 1000);
        let pct = calculate_cpu_percentage(&stats);
        assert!((pct - 20.0).abs() < 1e-9, "got {}", pct);
    }

    #[test]
    fn test_cpu_percentage_counter_reset_is_zero() {
        let stats = stats_with(50, 100, 1100, 1000);
        assert_eq!(calculate_cpu_percentage(&stats), 0.0);
    }

    #[test]
    fn test_cpu_percentage_missing_precpu_is_zero() {
        let mut stats = stats_with(110, 100, 1100, 1000);
        stats.precpu_stats = None;
        assert_eq!(calculate_cpu_percentage(&stats), 0.0);
    }

    #[test]
    fn test_cpu_percentage_no_system_delta_is_zero() {
        let stats = stats_with(110, 100, 1000, 1000);
        assert_eq!(calculate_cpu_percentage(&stats), 0.0);
    }
}
