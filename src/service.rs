//! Crawl service tying the admission pieces together
//!
//! `CrawlService` owns the worker pool, the concurrency gate and the
//! dispatcher built from them. It is constructed once at startup and shared
//! behind an `Arc`; single, batch and deep crawls all funnel into
//! `Dispatcher::submit`.

use crate::{
    deep_crawl, deep_crawl_stream, validate_url, ChromeWorkerFactory, ConcurrencyGate, Config,
    CrawlError, CrawlJob, CrawlOptions, DeepCrawlRequest, Dispatcher, JobResult, Metrics,
    PoolStats, WorkerFactory, WorkerPool,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tracing::info;

/// Crawl front-end over a bounded worker pool
///
/// # Examples
///
/// ```rust,no_run
/// use crawl_gateway::{Config, CrawlOptions, CrawlService, Metrics};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let service = CrawlService::with_chrome(Config::default(), Arc::new(Metrics::new()))?;
///
///     let result = service
///         .crawl("https://example.com", CrawlOptions::default())
///         .await?;
///     println!("{}", serde_json::to_string_pretty(&result)?);
///
///     service.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct CrawlService {
    dispatcher: Dispatcher,
    config: Config,
    metrics: Arc<Metrics>,
    started_at: Instant,
    accepting: AtomicBool,
    maintenance: Option<JoinHandle<()>>,
}

impl CrawlService {
    /// Build the service around `factory`. Must be called inside a tokio
    /// runtime when idle reaping is configured.
    pub fn new(
        config: Config,
        factory: Arc<dyn WorkerFactory>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, CrawlError> {
        config.validate()?;

        let pool = WorkerPool::new(config.worker_pool_size, factory, metrics.clone());
        let gate = ConcurrencyGate::new(config.max_concurrent_jobs);

        let maintenance = config.worker_idle_timeout.map(|max_idle| {
            let every = (max_idle / 4).max(Duration::from_secs(1));
            pool.spawn_maintenance(max_idle, every)
        });

        let dispatcher = Dispatcher::new(
            pool,
            gate,
            config.job_timeout,
            config.admission_timeout,
            metrics.clone(),
        );

        info!(
            "Crawl service ready: pool size {}, max concurrent jobs {}, job timeout {:?}",
            config.worker_pool_size, config.max_concurrent_jobs, config.job_timeout
        );

        Ok(Self {
            dispatcher,
            config,
            metrics,
            started_at: Instant::now(),
            accepting: AtomicBool::new(true),
            maintenance,
        })
    }

    /// Service backed by headless Chrome workers
    pub fn with_chrome(config: Config, metrics: Arc<Metrics>) -> Result<Self, CrawlError> {
        let factory = Arc::new(ChromeWorkerFactory::new(config.browser.clone()));
        Self::new(config, factory, metrics)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        self.dispatcher.gate()
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.dispatcher.pool().stats().await
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    fn ensure_accepting(&self) -> Result<(), CrawlError> {
        if self.is_accepting() {
            Ok(())
        } else {
            Err(CrawlError::ShuttingDown)
        }
    }

    fn jobs_for(&self, urls: Vec<String>, options: &CrawlOptions) -> Result<Vec<CrawlJob>, CrawlError> {
        urls.into_iter()
            .map(|url| {
                validate_url(&url)?;
                Ok(CrawlJob::new(url.trim(), options.clone()))
            })
            .collect()
    }

    pub async fn crawl(&self, url: &str, options: CrawlOptions) -> Result<JobResult, CrawlError> {
        self.ensure_accepting()?;
        let mut jobs = self.jobs_for(vec![url.to_string()], &options)?;
        let job = jobs
            .pop()
            .ok_or_else(|| CrawlError::Internal("no job built".to_string()))?;

        Ok(self.dispatcher.submit(job).await)
    }

    /// Crawl every URL; one result per URL in input order. Any invalid URL
    /// rejects the whole request before a job starts.
    pub async fn crawl_batch(
        &self,
        urls: Vec<String>,
        options: CrawlOptions,
    ) -> Result<Vec<JobResult>, CrawlError> {
        self.ensure_accepting()?;
        let jobs = self.jobs_for(urls, &options)?;
        info!("Starting batch of {} jobs", jobs.len());

        Ok(self.dispatcher.run_batch(jobs).await)
    }

    pub fn crawl_batch_stream(
        &self,
        urls: Vec<String>,
        options: CrawlOptions,
    ) -> Result<ReceiverStream<JobResult>, CrawlError> {
        self.ensure_accepting()?;
        let jobs = self.jobs_for(urls, &options)?;
        info!("Starting streamed batch of {} jobs", jobs.len());

        Ok(self.dispatcher.stream_batch(jobs))
    }

    pub async fn deep_crawl(&self, request: &DeepCrawlRequest) -> Result<Vec<JobResult>, CrawlError> {
        self.ensure_accepting()?;
        deep_crawl(&self.dispatcher, request).await
    }

    pub fn deep_crawl_stream(
        &self,
        request: &DeepCrawlRequest,
    ) -> Result<UnboundedReceiverStream<JobResult>, CrawlError> {
        self.ensure_accepting()?;
        deep_crawl_stream(self.dispatcher.clone(), request)
    }

    /// Refuse new work and report unhealthy. Jobs already holding a slot
    /// finish on their workers; pooled workers stay up until `shutdown`.
    pub fn begin_shutdown(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            info!("Crawl service no longer accepting work");
        }
        self.dispatcher.close();
    }

    /// Stop accepting work, stop the gate and dispose pooled workers.
    pub async fn shutdown(&self) {
        info!("Shutting down crawl service...");
        self.begin_shutdown();

        if let Some(task) = &self.maintenance {
            task.abort();
        }
        self.dispatcher.shutdown().await;

        info!("Crawl service shutdown complete");
    }
}
