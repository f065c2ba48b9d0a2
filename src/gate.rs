use crate::CrawlError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Counting admission gate bounding how many jobs execute at once.
///
/// Waiters are served in FIFO order. A permit is returned when its
/// `GatePermit` is dropped, so failure, panic unwinding and cancellation all
/// release it.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// A granted slot; the slot is freed on drop.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a slot, giving up with `AdmissionTimeout` once `deadline`
    /// passes. `None` waits indefinitely.
    pub async fn acquire(&self, deadline: Option<Duration>) -> Result<GatePermit, CrawlError> {
        let acquire = Arc::clone(&self.semaphore).acquire_owned();

        let permit = match deadline {
            Some(limit) => tokio::time::timeout(limit, acquire)
                .await
                .map_err(|_| CrawlError::AdmissionTimeout(limit))??,
            None => acquire.await?,
        };

        Ok(GatePermit { _permit: permit })
    }

    /// Run `fut` while holding a slot.
    ///
    /// `fut` is not polled until the slot is granted, so an expired deadline
    /// never starts it.
    pub async fn with_permit<F, T>(&self, deadline: Option<Duration>, fut: F) -> Result<T, CrawlError>
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire(deadline).await?;
        Ok(fut.await)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.available_permits())
    }

    /// Stop admitting; pending and future waits fail with `ShuttingDown`.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_peak_concurrency_is_bounded() {
        let gate = ConcurrencyGate::new(2);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let gate = gate.clone();
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    gate.with_permit(None, async {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(gate.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_failures_release_permits() {
        let gate = ConcurrencyGate::new(2);

        for _ in 0..3 {
            let result: Result<Result<(), &str>, _> =
                gate.with_permit(None, async { Err("boom") }).await;
            assert!(result.unwrap().is_err());
        }

        assert_eq!(gate.available_permits(), 2);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_never_runs_the_job() {
        let gate = ConcurrencyGate::new(1);
        let _held = gate.acquire(None).await.unwrap();
        let ran = AtomicBool::new(false);

        let result = gate
            .with_permit(Some(Duration::from_millis(50)), async {
                ran.store(true, Ordering::SeqCst);
            })
            .await;

        assert!(matches!(result, Err(CrawlError::AdmissionTimeout(_))));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(gate.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_holder_releases_permit() {
        let gate = ConcurrencyGate::new(1);
        let task_gate = gate.clone();
        let handle = tokio::spawn(async move {
            task_gate
                .with_permit(None, tokio::time::sleep(Duration::from_secs(3600)))
                .await
        });

        while gate.available_permits() != 0 {
            tokio::task::yield_now().await;
        }
        handle.abort();
        let _ = handle.await;

        assert_eq!(gate.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_closed_gate_rejects() {
        let gate = ConcurrencyGate::new(1);
        gate.close();
        assert!(matches!(
            gate.acquire(None).await,
            Err(CrawlError::ShuttingDown)
        ));
    }
}
