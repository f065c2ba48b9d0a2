use crate::{CrawlService, PoolStats};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    ShuttingDown,
}

/// Body of the health probe
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthLevel,
    pub service: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub pool: PoolStats,
    pub jobs_in_flight: usize,
    pub max_concurrent_jobs: usize,
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthLevel::Healthy
    }
}

pub async fn check_health(service: &CrawlService) -> HealthReport {
    let status = if service.is_accepting() {
        HealthLevel::Healthy
    } else {
        HealthLevel::ShuttingDown
    };

    HealthReport {
        status,
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: service.uptime().as_secs(),
        pool: service.pool_stats().await,
        jobs_in_flight: service.gate().in_flight(),
        max_concurrent_jobs: service.gate().capacity(),
        timestamp: Utc::now(),
    }
}
