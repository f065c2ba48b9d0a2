//! Bounded pool of reusable crawl workers
//!
//! Workers are expensive to start (a browser process each) and cheap to reuse,
//! so the pool keeps up to `capacity` idle ones around. Checkout never waits
//! on capacity: a miss creates a fresh worker. Capacity only bounds what is
//! kept when workers come back; the surplus is disposed.

use crate::{CrawlError, CrawlJob, CrawlOutput, Metrics};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A long-lived handle able to run one crawl job at a time
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Worker: Send {
    async fn execute(&mut self, job: &CrawlJob) -> Result<CrawlOutput, CrawlError>;

    /// Release every resource held by the worker. Awaited to completion.
    async fn shutdown(&mut self);

    fn is_alive(&self) -> bool;
}

/// Builds new workers on pool misses
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn Worker>, CrawlError>;
}

struct IdleWorker {
    id: u64,
    worker: Box<dyn Worker>,
    idle_since: Instant,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub idle: usize,
    pub checked_out: usize,
    pub created: u64,
    pub disposed: u64,
}

pub struct WorkerPool {
    idle: Arc<Mutex<Vec<IdleWorker>>>,
    factory: Arc<dyn WorkerFactory>,
    capacity: usize,
    next_id: Arc<AtomicU64>,
    created: Arc<AtomicU64>,
    disposed: Arc<AtomicU64>,
    checked_out: Arc<AtomicUsize>,
    is_shutting_down: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
}

impl WorkerPool {
    pub fn new(capacity: usize, factory: Arc<dyn WorkerFactory>, metrics: Arc<Metrics>) -> Self {
        Self {
            idle: Arc::new(Mutex::new(Vec::with_capacity(capacity))),
            factory,
            capacity,
            next_id: Arc::new(AtomicU64::new(0)),
            created: Arc::new(AtomicU64::new(0)),
            disposed: Arc::new(AtomicU64::new(0)),
            checked_out: Arc::new(AtomicUsize::new(0)),
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            metrics,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Check out a worker, reusing an idle one when possible.
    pub async fn acquire(&self) -> Result<WorkerLease, CrawlError> {
        if self.is_shutting_down() {
            return Err(CrawlError::ShuttingDown);
        }

        loop {
            let candidate = {
                let mut idle = self.idle.lock().await;
                let candidate = idle.pop();
                self.metrics.set_idle_workers(idle.len());
                candidate
            };

            match candidate {
                Some(entry) if entry.worker.is_alive() => {
                    debug!("Reusing idle worker {}", entry.id);
                    return Ok(self.lease(entry.id, entry.worker));
                }
                Some(entry) => {
                    warn!("Idle worker {} is no longer alive, disposing", entry.id);
                    self.dispose(entry.id, entry.worker).await;
                }
                None => break,
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let worker = self.factory.create().await.map_err(|e| match e {
            CrawlError::WorkerInit(_) => e,
            other => CrawlError::WorkerInit(other.to_string()),
        })?;

        self.created.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_worker_created();
        debug!("Created worker {}", id);

        Ok(self.lease(id, worker))
    }

    fn lease(&self, id: u64, worker: Box<dyn Worker>) -> WorkerLease {
        self.checked_out.fetch_add(1, Ordering::SeqCst);
        WorkerLease {
            id,
            worker: Some(worker),
            pool: self.clone(),
        }
    }

    /// Take a worker back. Dead workers, workers returned during shutdown and
    /// workers beyond capacity are disposed.
    async fn return_worker(&self, id: u64, worker: Box<dyn Worker>) {
        if !worker.is_alive() {
            warn!("Worker {} returned dead, disposing", id);
            self.dispose(id, worker).await;
            return;
        }

        let rejected = {
            let mut idle = self.idle.lock().await;
            if self.is_shutting_down() || idle.len() >= self.capacity {
                Some(worker)
            } else {
                idle.push(IdleWorker {
                    id,
                    worker,
                    idle_since: Instant::now(),
                });
                self.metrics.set_idle_workers(idle.len());
                None
            }
        };

        if let Some(worker) = rejected {
            debug!("Pool full or closing, disposing worker {}", id);
            self.dispose(id, worker).await;
        }
    }

    async fn dispose(&self, id: u64, mut worker: Box<dyn Worker>) {
        worker.shutdown().await;
        self.disposed.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_worker_disposed();
        debug!("Disposed worker {}", id);
    }

    /// Dispose every idle worker. Returns how many were disposed.
    pub async fn drain(&self) -> usize {
        let drained = {
            let mut idle = self.idle.lock().await;
            self.metrics.set_idle_workers(0);
            std::mem::take(&mut *idle)
        };

        let count = drained.len();
        for entry in drained {
            self.dispose(entry.id, entry.worker).await;
        }
        count
    }

    /// Close the pool and dispose the idle workers. Leases still out are
    /// disposed when they come back.
    pub async fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.is_shutting_down.store(true, Ordering::SeqCst);

        let drained = self.drain().await;
        info!(
            "Worker pool shutdown complete ({} idle disposed, {} still checked out)",
            drained,
            self.checked_out.load(Ordering::SeqCst)
        );
    }

    /// Dispose idle workers that have not been used for `max_idle`.
    pub async fn reap_idle(&self, max_idle: Duration) -> usize {
        let stale: Vec<IdleWorker> = {
            let mut idle = self.idle.lock().await;
            let (stale, fresh): (Vec<_>, Vec<_>) = std::mem::take(&mut *idle)
                .into_iter()
                .partition(|entry| entry.idle_since.elapsed() >= max_idle);
            *idle = fresh;
            self.metrics.set_idle_workers(idle.len());
            stale
        };

        let count = stale.len();
        for entry in stale {
            debug!("Reaping worker {} after {:?} idle", entry.id, max_idle);
            self.dispose(entry.id, entry.worker).await;
        }
        count
    }

    /// Periodically reap idle workers until the pool shuts down.
    pub fn spawn_maintenance(&self, max_idle: Duration, every: Duration) -> JoinHandle<()> {
        let pool = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;

            while !pool.is_shutting_down() {
                interval.tick().await;
                let reaped = pool.reap_idle(max_idle).await;
                if reaped > 0 {
                    info!("Reaped {} idle workers", reaped);
                }
            }
        })
    }

    pub async fn stats(&self) -> PoolStats {
        let idle = self.idle.lock().await.len();

        PoolStats {
            capacity: self.capacity,
            idle,
            checked_out: self.checked_out.load(Ordering::SeqCst),
            created: self.created.load(Ordering::Relaxed),
            disposed: self.disposed.load(Ordering::Relaxed),
        }
    }
}

impl Clone for WorkerPool {
    fn clone(&self) -> Self {
        Self {
            idle: self.idle.clone(),
            factory: self.factory.clone(),
            capacity: self.capacity,
            next_id: self.next_id.clone(),
            created: self.created.clone(),
            disposed: self.disposed.clone(),
            checked_out: self.checked_out.clone(),
            is_shutting_down: self.is_shutting_down.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

/// Exclusive checkout of one worker.
///
/// End it with `release` (worker healthy) or `discard` (worker broken). A
/// lease dropped without either disposes its worker in the background.
pub struct WorkerLease {
    id: u64,
    worker: Option<Box<dyn Worker>>,
    pool: WorkerPool,
}

impl WorkerLease {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn execute(&mut self, job: &CrawlJob) -> Result<CrawlOutput, CrawlError> {
        match self.worker.as_mut() {
            Some(worker) => worker.execute(job).await,
            None => Err(CrawlError::Internal(format!(
                "worker {} used after return",
                self.id
            ))),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.worker.as_ref().map_or(false, |w| w.is_alive())
    }

    pub async fn release(mut self) {
        if let Some(worker) = self.take() {
            self.pool.return_worker(self.id, worker).await;
        }
    }

    pub async fn discard(mut self) {
        if let Some(worker) = self.take() {
            self.pool.dispose(self.id, worker).await;
        }
    }

    fn take(&mut self) -> Option<Box<dyn Worker>> {
        let worker = self.worker.take();
        if worker.is_some() {
            self.pool.checked_out.fetch_sub(1, Ordering::SeqCst);
        }
        worker
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        let Some(worker) = self.take() else {
            return;
        };

        warn!("Worker {} lease abandoned, disposing", self.id);
        let pool = self.pool.clone();
        let id = self.id;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    pool.dispose(id, worker).await;
                });
            }
            Err(_) => {
                // No runtime left to run an async shutdown on.
                pool.disposed.fetch_add(1, Ordering::Relaxed);
                drop(worker);
            }
        }
    }
}
