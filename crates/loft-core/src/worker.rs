use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::error::OrchError;

/// Bounded elastic pool for orchestration tasks, distinct from the pool
/// serving external requests. Request handlers enqueue and return
/// immediately with the join handle.
///
/// Sizing: `core` slots form the always-available baseline; up to
/// `max - core` burst slots engage only while the baseline is saturated and
/// free up again as soon as their task finishes. `queue` caps how many
/// accepted tasks may wait for a slot; beyond that, submission is rejected
/// rather than building an unbounded backlog.
pub struct WorkerPool {
    core: Arc<Semaphore>,
    burst: Arc<Semaphore>,
    queue: Arc<Semaphore>,
    burst_size: usize,
}

impl WorkerPool {
    pub fn new(core_workers: usize, max_workers: usize, queue: usize) -> Self {
        let burst_size = max_workers.saturating_sub(core_workers);
        Self {
            core: Arc::new(Semaphore::new(core_workers)),
            burst: Arc::new(Semaphore::new(burst_size)),
            queue: Arc::new(Semaphore::new(queue)),
            burst_size,
        }
    }

    pub fn spawn<F, T>(&self, task: F) -> Result<JoinHandle<T>, OrchError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let queue_slot = self
            .queue
            .clone()
            .try_acquire_owned()
            .map_err(|_| OrchError::Internal("orchestration queue full".into()))?;
        let core = self.core.clone();
        let burst = self.burst.clone();

        Ok(tokio::spawn(async move {
            let _slot = acquire_slot(core, burst).await;
            // out of the queue, onto a worker
            drop(queue_slot);
            task.await
        }))
    }

    /// Burst slots currently held by running tasks. Zero whenever load fits
    /// inside the core baseline.
    pub fn burst_in_use(&self) -> usize {
        self.burst_size - self.burst.available_permits()
    }
}

/// Prefer a core slot; spill into burst capacity only while the baseline is
/// busy. A burst slot is released the moment its task completes, shrinking
/// the pool back toward the core size.
async fn acquire_slot(core: Arc<Semaphore>, burst: Arc<Semaphore>) -> OwnedSemaphorePermit {
    if let Ok(permit) = core.clone().try_acquire_owned() {
        return permit;
    }
    tokio::select! {
        biased;
        permit = core.acquire_owned() => permit.expect("core semaphore closed"),
        permit = burst.acquire_owned() => permit.expect("burst semaphore closed"),
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(5, 20, 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrency_is_capped_at_max() {
        let pool = WorkerPool::new(1, 2, 100);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let running = running.clone();
            let peak = peak.clone();
            handles.push(
                pool.spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap(),
            );
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn load_within_the_core_never_bursts() {
        let pool = WorkerPool::new(3, 6, 100);
        let mut handles = Vec::new();
        for _ in 0..3 {
            handles.push(pool.spawn(tokio::time::sleep(Duration::from_millis(20))).unwrap());
        }
        // let the tasks claim their slots
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(pool.burst_in_use(), 0);
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn saturated_core_spills_into_burst_and_drains_back() {
        let pool = WorkerPool::new(2, 5, 100);
        let mut handles = Vec::new();
        for _ in 0..5 {
            handles.push(pool.spawn(tokio::time::sleep(Duration::from_millis(20))).unwrap());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(pool.burst_in_use() > 0, "expected the overflow to take burst slots");

        for h in handles {
            h.await.unwrap();
        }
        // burst capacity expires with its tasks
        assert_eq!(pool.burst_in_use(), 0);
    }

    #[tokio::test]
    async fn overflowing_the_queue_is_rejected() {
        // current-thread runtime: spawned tasks cannot release their queue
        // slots before the test yields, so the bound is observed exactly
        let pool = WorkerPool::new(1, 1, 2);
        let h1 = pool.spawn(tokio::time::sleep(Duration::from_millis(5))).unwrap();
        let h2 = pool.spawn(tokio::time::sleep(Duration::from_millis(5))).unwrap();

        let err = pool.spawn(async {}).unwrap_err();
        assert!(matches!(err, OrchError::Internal(_)));

        h1.await.unwrap();
        h2.await.unwrap();
        // capacity is available again once the backlog drained
        pool.spawn(async {}).unwrap().await.unwrap();
    }
}
