use crate::{
    ConcurrencyGate, CrawlError, CrawlJob, CrawlOutput, JobResult, Metrics, WorkerPool,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, warn};

/// Runs crawl jobs on pooled workers, bounded by a `ConcurrencyGate`.
///
/// Every job goes through `submit`, which never fails as a whole: whatever
/// happens to a job comes back as a `JobResult`.
#[derive(Clone)]
pub struct Dispatcher {
    pool: WorkerPool,
    gate: ConcurrencyGate,
    job_timeout: Duration,
    admission_timeout: Option<Duration>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(
        pool: WorkerPool,
        gate: ConcurrencyGate,
        job_timeout: Duration,
        admission_timeout: Option<Duration>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            pool,
            gate,
            job_timeout,
            admission_timeout,
            metrics,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub async fn submit(&self, job: CrawlJob) -> JobResult {
        debug!("Dispatching job {} for URL: {}", job.id, job.url);
        let started = Instant::now();

        let outcome = self.execute(&job).await;
        let elapsed = started.elapsed();
        self.metrics.record_job(elapsed, outcome.as_ref().err());

        match outcome {
            Ok(output) => JobResult::success(&job, output, elapsed),
            Err(e) => {
                warn!("Job {} for {} failed: {}", job.id, job.url, e);
                JobResult::failure(&job, &e, elapsed)
            }
        }
    }

    async fn execute(&self, job: &CrawlJob) -> Result<CrawlOutput, CrawlError> {
        let deadline = job.options.admission_timeout.or(self.admission_timeout);
        let permit = self.gate.acquire(deadline).await?;
        self.metrics.set_in_flight(self.gate.in_flight());

        let result = self.run_on_worker(job).await;

        drop(permit);
        self.metrics.set_in_flight(self.gate.in_flight());
        result
    }

    async fn run_on_worker(&self, job: &CrawlJob) -> Result<CrawlOutput, CrawlError> {
        let mut lease = self.pool.acquire().await?;
        let limit = job.options.timeout.unwrap_or(self.job_timeout);

        let result = match tokio::time::timeout(limit, lease.execute(job)).await {
            Ok(result) => result,
            Err(_) => Err(CrawlError::Timeout(limit)),
        };

        match &result {
            Err(e) if e.breaks_worker() => {
                warn!("Worker {} broken by job {}: {}", lease.id(), job.id, e);
                lease.discard().await;
            }
            _ => lease.release().await,
        }

        result
    }

    /// Run every job concurrently and return one result per job, in input
    /// order.
    pub async fn run_batch(&self, jobs: Vec<CrawlJob>) -> Vec<JobResult> {
        let pending: Vec<_> = jobs.into_iter().map(|job| self.spawn_job(job)).collect();
        futures::future::join_all(pending).await
    }

    /// Run every job concurrently and yield results as they complete.
    ///
    /// Dropping the stream cancels the jobs that have not finished yet.
    pub fn stream_batch(&self, jobs: Vec<CrawlJob>) -> ReceiverStream<JobResult> {
        let (tx, rx) = mpsc::channel(jobs.len().max(1));

        for job in jobs {
            let pending = self.spawn_job(job);
            let tx = tx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    result = pending => {
                        if tx.send(result).await.is_err() {
                            debug!("Result receiver dropped before job finished");
                        }
                    }
                    _ = tx.closed() => {
                        debug!("Result receiver dropped, cancelling job");
                    }
                }
            });
        }

        ReceiverStream::new(rx)
    }

    /// Start `job` on its own task. The returned future resolves to its
    /// result, turning a panicked task into an `Internal` failure. Dropping
    /// it aborts the task, so a cancelled caller never leaves jobs behind.
    fn spawn_job(&self, job: CrawlJob) -> impl Future<Output = JobResult> + Send + 'static {
        let dispatcher = self.clone();
        let fallback = job.clone();
        let handle = tokio::spawn(async move { dispatcher.submit(job).await });
        let guard = AbortOnDrop(handle.abort_handle());

        async move {
            let _guard = guard;
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!("Job {} task failed: {}", fallback.id, e);
                    JobResult::failure(
                        &fallback,
                        &CrawlError::Internal(format!("job task failed: {e}")),
                        Duration::ZERO,
                    )
                }
            }
        }
    }

    /// Stop admitting jobs. Jobs already holding a slot run to completion.
    pub fn close(&self) {
        self.gate.close();
    }

    /// Stop admitting jobs and close the pool.
    pub async fn shutdown(&self) {
        self.close();
        self.pool.shutdown().await;
    }
}

/// Aborts a spawned job when its caller goes away
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
