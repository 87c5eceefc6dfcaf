//! Bounded worker pool for single-request evaluations
//!
//! At most `size` tasks run at once. Each task checks store liveness before
//! it starts and receives its own cancellation token; shutdown cancels the
//! running tokens newest first and waits for every task to finish. A failed
//! task is logged and never takes the pool down.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use watchtower_core::{Error, Result};
use watchtower_store::Liveness;

pub const DEFAULT_POOL_SIZE: usize = 5;

pub struct WorkerPool {
    size: usize,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    liveness: Arc<dyn Liveness>,
    shutdown: CancellationToken,
    running: Arc<Mutex<Vec<(u64, CancellationToken)>>>,
    next_id: AtomicU64,
}

impl WorkerPool {
    pub fn new(size: usize, liveness: Arc<dyn Liveness>) -> Self {
        let size = size.max(1);
        Self {
            size,
            semaphore: Arc::new(Semaphore::new(size)),
            tracker: TaskTracker::new(),
            liveness,
            shutdown: CancellationToken::new(),
            running: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Tasks spawned and not yet finished
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Queue a task. It runs once a slot is free and the store answers.
    ///
    /// The handle resolves to the task's own result, `Cancelled` when the
    /// pool shut down first, or the liveness error.
    pub fn submit<F, Fut, T>(&self, label: impl Into<String>, task: F) -> JoinHandle<Result<T>>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let label = label.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let semaphore = self.semaphore.clone();
        let liveness = self.liveness.clone();
        let shutdown = self.shutdown.clone();
        let running = self.running.clone();

        self.tracker.spawn(async move {
            let _permit = tokio::select! {
                permit = semaphore.acquire_owned() => {
                    permit.map_err(|_| Error::Cancelled)?
                }
                () = shutdown.cancelled() => return Err(Error::Cancelled),
            };
            if shutdown.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if let Err(err) = ensure_live(liveness.as_ref()).await {
                warn!(task = %label, error = %err, "Store unavailable, task skipped");
                return Err(err);
            }

            let token = shutdown.child_token();
            running.lock().push((id, token.clone()));
            debug!(task = %label, "Task started");
            let result = task(token).await;
            running.lock().retain(|(running_id, _)| *running_id != id);

            if let Err(err) = &result {
                warn!(task = %label, error = %err, "Task failed");
            }
            result
        })
    }

    /// Stop accepting work, cancel running tasks newest first and wait for
    /// all of them
    pub async fn shutdown(&self) {
        self.tracker.close();
        let tokens: Vec<CancellationToken> = {
            let mut running = self.running.lock();
            running.drain(..).map(|(_, token)| token).collect()
        };
        let cancelled = tokens.len();
        for token in tokens.into_iter().rev() {
            token.cancel();
        }
        self.shutdown.cancel();
        self.semaphore.close();
        self.tracker.wait().await;
        info!(cancelled, "Worker pool shut down");
    }

    /// Wait for every queued task without cancelling anything
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

/// A failed ping is retried once; pooled drivers replace the broken
/// connection on the next acquire
async fn ensure_live(liveness: &dyn Liveness) -> Result<()> {
    match liveness.ping().await {
        Ok(()) => Ok(()),
        Err(err) => {
            debug!(error = %err, "Liveness check failed, reconnecting");
            liveness.ping().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct FlakyLiveness {
        failures: AtomicUsize,
        pings: AtomicUsize,
    }

    #[async_trait]
    impl Liveness for FlakyLiveness {
        async fn ping(&self) -> Result<()> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::database("connection reset"));
            }
            Ok(())
        }
    }

    fn pool(size: usize) -> (WorkerPool, Arc<FlakyLiveness>) {
        let liveness = Arc::new(FlakyLiveness::default());
        (WorkerPool::new(size, liveness.clone()), liveness)
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let (pool, _) = pool(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let active = active.clone();
                let peak = peak.clone();
                pool.submit(format!("task-{i}"), move |_| async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }
        assert_eq!(results, vec![0, 1, 2, 3, 4, 5]);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_failed_task_does_not_stop_pool() {
        let (pool, _) = pool(1);
        let failed = pool.submit("broken", |_| async { Err::<(), _>(Error::internal("boom")) });
        assert!(failed.await.unwrap().is_err());

        let next = pool.submit("next", |_| async { Ok(7) });
        assert_eq!(next.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_liveness_checked_and_retried() {
        let (pool, liveness) = pool(1);
        liveness.failures.store(1, Ordering::SeqCst);
        let handle = pool.submit("task", |_| async { Ok(()) });
        handle.await.unwrap().unwrap();
        assert_eq!(liveness.pings.load(Ordering::SeqCst), 2);

        liveness.failures.store(2, Ordering::SeqCst);
        let handle = pool.submit("task", |_| async { Ok(()) });
        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_tasks() {
        let (pool, _) = pool(2);
        let handle = pool.submit("long", |cancel| async move {
            cancel.cancelled().await;
            Err::<(), _>(Error::Cancelled)
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        pool.shutdown().await;
        assert!(matches!(handle.await.unwrap(), Err(Error::Cancelled)));
        assert!(pool.is_shut_down());

        let late = pool.submit("late", |_| async { Ok(()) });
        assert!(matches!(late.await.unwrap(), Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_drain_waits_without_cancelling() {
        let (pool, _) = pool(2);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let done = done.clone();
            pool.submit("work", move |cancel| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                assert!(!cancel.is_cancelled());
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        pool.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(pool.pending(), 0);
    }
}
