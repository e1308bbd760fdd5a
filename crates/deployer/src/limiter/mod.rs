//! Rate limiter — per-source-address sliding-window admission.
//!
//! The counting/insert atomicity lives in the store (`rate_admit`); this
//! layer applies configuration and metrics.

use std::sync::Arc;

use crate::conf::RateLimitConfig;
use crate::error::DeployError;
use crate::metrics::DeployerMetrics;
use crate::store::rate::RateDecision;
use crate::store::Store;

pub struct RateLimiter {
    store: Arc<Store>,
    metrics: Arc<DeployerMetrics>,
    window_sec: i64,
    limit: i64,
}

impl RateLimiter {
    pub fn new(store: Arc<Store>, metrics: Arc<DeployerMetrics>, config: &RateLimitConfig) -> Self {
        Self {
            store,
            metrics,
            window_sec: config.rate_limit_window_sec,
            limit: config.max_containers_per_source_per_window,
        }
    }

    pub fn window_sec(&self) -> i64 {
        self.window_sec
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    /// Admit or reject one deploy attempt from `ip`. A successful admission
    /// consumes one window slot.
    pub async fn admit(&self, ip: &str, now: i64) -> Result<(), DeployError> {
        self.metrics.rate_limit_checks_total.inc();
        let decision = self
            .store
            .rate_admit(ip, now, self.window_sec, self.limit)
            .await?;
        match decision {
            RateDecision::Admitted => Ok(()),
            RateDecision::Rejected { count } => {
                self.metrics.rate_limit_rejections_total.inc();
                tracing::info!(
                    ip = %ip,
                    count = count,
                    limit = self.limit,
                    "Deploy rejected by rate limiter"
                );
                Err(DeployError::RateLimited)
            }
        }
    }
}
