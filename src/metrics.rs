use crate::CrawlError;
use metrics::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tracing::info;

/// Handles for every metric the gateway records.
///
/// Handles are bound to whichever recorder is installed when `Metrics::new`
/// runs; with no recorder they are no-ops.
pub struct Metrics {
    pub jobs_succeeded: Counter,
    pub jobs_failed: Counter,
    pub job_duration: Histogram,
    pub job_timeouts: Counter,
    pub admission_timeouts: Counter,
    pub jobs_in_flight: Gauge,
    pub workers_created: Counter,
    pub workers_disposed: Counter,
    pub workers_idle: Gauge,
    pub rate_limited_requests: Counter,
    pub unauthorized_requests: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            jobs_succeeded: register_counter!("crawl_jobs_succeeded_total"),
            jobs_failed: register_counter!("crawl_jobs_failed_total"),
            job_duration: register_histogram!("crawl_job_duration_seconds"),
            job_timeouts: register_counter!("crawl_job_timeouts_total"),
            admission_timeouts: register_counter!("crawl_admission_timeouts_total"),
            jobs_in_flight: register_gauge!("crawl_jobs_in_flight"),
            workers_created: register_counter!("crawl_workers_created_total"),
            workers_disposed: register_counter!("crawl_workers_disposed_total"),
            workers_idle: register_gauge!("crawl_workers_idle"),
            rate_limited_requests: register_counter!("http_rate_limited_requests_total"),
            unauthorized_requests: register_counter!("http_unauthorized_requests_total"),
        }
    }

    pub fn record_job(&self, duration: Duration, error: Option<&CrawlError>) {
        match error {
            None => self.jobs_succeeded.increment(1),
            Some(err) => {
                self.jobs_failed.increment(1);
                match err {
                    CrawlError::Timeout(_) => self.job_timeouts.increment(1),
                    CrawlError::AdmissionTimeout(_) => self.admission_timeouts.increment(1),
                    _ => {}
                }
            }
        }

        self.job_duration.record(duration.as_secs_f64());
    }

    pub fn set_in_flight(&self, count: usize) {
        self.jobs_in_flight.set(count as f64);
    }

    pub fn record_worker_created(&self) {
        self.workers_created.increment(1);
    }

    pub fn record_worker_disposed(&self) {
        self.workers_disposed.increment(1);
    }

    pub fn set_idle_workers(&self, count: usize) {
        self.workers_idle.set(count as f64);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited_requests.increment(1);
    }

    pub fn record_unauthorized(&self) {
        self.unauthorized_requests.increment(1);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the process-wide Prometheus recorder.
///
/// Must run before `Metrics::new` so the handles bind to it. Fails if a
/// recorder is already installed.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, CrawlError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| CrawlError::ConfigurationError(format!("metrics recorder: {e}")))?;

    info!("Prometheus recorder installed");
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let metrics = Metrics::new();
        metrics.record_job(Duration::from_millis(120), None);
        metrics.record_job(
            Duration::from_secs(5),
            Some(&CrawlError::Timeout(Duration::from_secs(5))),
        );
        metrics.record_worker_created();
        metrics.record_worker_disposed();
        metrics.set_idle_workers(3);
        metrics.set_in_flight(2);
        metrics.record_rate_limited();
        metrics.record_unauthorized();
    }
}
