//! Job descriptions and per-job results
//!
//! A `CrawlJob` is one independent unit of work (one URL). Every submitted job
//! produces exactly one `JobResult`, whether it succeeded or not.

use crate::CrawlError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-job knobs supplied by the caller
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CrawlOptions {
    /// Skip the browser cache for this job (default: false)
    pub bypass_cache: bool,

    /// Run page JavaScript (default: true)
    pub js_enabled: bool,

    /// Execution timeout, overriding `Config::job_timeout`
    pub timeout: Option<Duration>,

    /// How long to wait for a crawl slot, overriding `Config::admission_timeout`
    pub admission_timeout: Option<Duration>,

    /// Extra settle time after navigation completes
    pub wait_for: Option<Duration>,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            bypass_cache: false,
            js_enabled: true,
            timeout: None,
            admission_timeout: None,
            wait_for: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrawlJob {
    pub id: String,
    pub url: String,
    pub options: CrawlOptions,
}

impl CrawlJob {
    pub fn new(url: impl Into<String>, options: CrawlOptions) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.into(),
            options,
        }
    }
}

impl Default for CrawlJob {
    fn default() -> Self {
        Self::new(String::new(), CrawlOptions::default())
    }
}

/// What a worker hands back for a page it managed to load
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CrawlOutput {
    /// HTTP status of the main document, when the page came over the network
    pub status_code: Option<u16>,
    pub final_url: Option<String>,
    pub title: Option<String>,
    pub html: String,
    pub text: String,
    pub links: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The job ran past its execution timeout
    Timeout,
    /// No crawl slot became free before the admission deadline
    AdmissionTimeout,
    /// A worker could not be constructed
    WorkerInit,
    /// The job ran and failed
    Execution,
    /// Anything else (task panic, shutdown)
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Success(CrawlOutput),
    Failure { kind: FailureKind, message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub job_id: String,
    pub url: String,
    pub duration_ms: u64,
    #[serde(flatten)]
    pub outcome: JobOutcome,
}

impl JobResult {
    pub fn success(job: &CrawlJob, output: CrawlOutput, duration: Duration) -> Self {
        Self {
            job_id: job.id.clone(),
            url: job.url.clone(),
            duration_ms: duration.as_millis() as u64,
            outcome: JobOutcome::Success(output),
        }
    }

    pub fn failure(job: &CrawlJob, error: &CrawlError, duration: Duration) -> Self {
        Self {
            job_id: job.id.clone(),
            url: job.url.clone(),
            duration_ms: duration.as_millis() as u64,
            outcome: JobOutcome::Failure {
                kind: error.failure_kind(),
                message: error.to_string(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, JobOutcome::Success(_))
    }

    pub fn output(&self) -> Option<&CrawlOutput> {
        match &self.outcome {
            JobOutcome::Success(output) => Some(output),
            JobOutcome::Failure { .. } => None,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.outcome {
            JobOutcome::Success(_) => None,
            JobOutcome::Failure { kind, .. } => Some(*kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_result_serializes_with_status_tag() {
        let job = CrawlJob::new("https://example.com", CrawlOptions::default());
        let result = JobResult::failure(
            &job,
            &CrawlError::Timeout(Duration::from_secs(5)),
            Duration::from_millis(5001),
        );

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "failure");
        assert_eq!(value["kind"], "timeout");
        assert_eq!(value["url"], "https://example.com");
        assert_eq!(value["duration_ms"], 5001);
    }

    #[test]
    fn test_success_result_flattens_output() {
        let job = CrawlJob::new("https://example.com", CrawlOptions::default());
        let output = CrawlOutput {
            status_code: Some(404),
            title: Some("Example Domain".to_string()),
            links: vec!["https://www.iana.org/domains/example".to_string()],
            ..Default::default()
        };
        let result = JobResult::success(&job, output, Duration::from_millis(40));

        assert!(result.is_success());
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["status_code"], 404);
        assert_eq!(value["title"], "Example Domain");
        assert_eq!(value["links"][0], "https://www.iana.org/domains/example");
    }

    #[test]
    fn test_job_ids_are_unique() {
        let a = CrawlJob::default();
        let b = CrawlJob::default();
        assert_ne!(a.id, b.id);
        assert!(a.url.is_empty());
        assert!(a.options.js_enabled);
    }
}
