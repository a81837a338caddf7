//! Bounded worker pool for detached background tasks.
//!
//! Knowledge extraction, integrity checks and queue consumers run here so
//! the request critical path never waits on them. The pool is bounded by a
//! semaphore; spawn itself never blocks (the permit is taken inside the
//! spawned task). Shutdown flips a watch flag and waits for in-flight
//! tasks up to a grace period.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tracing::{debug, warn};

/// A handle to a spawned background task.
#[derive(Debug)]
pub struct TaskHandle {
    /// Task label for logs.
    pub name: String,
    join: tokio::task::JoinHandle<()>,
}

impl TaskHandle {
    /// Await completion (used by tests; production fire-and-forgets).
    ///
    /// # Errors
    ///
    /// Returns an error if the task panicked or was aborted.
    pub async fn join(self) -> Result<(), tokio::task::JoinError> {
        self.join.await
    }

    /// Abort the task.
    pub fn abort(&self) {
        self.join.abort();
    }
}

/// Bounded pool of detached background tasks.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    completed: Arc<AtomicU64>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Create a pool bounded to `cap` concurrent tasks.
    pub fn new(cap: usize) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            permits: Arc::new(Semaphore::new(cap.max(1))),
            active: Arc::new(AtomicUsize::new(0)),
            completed: Arc::new(AtomicU64::new(0)),
            shutdown_tx,
        }
    }

    /// Spawn a detached task. Non-blocking: the concurrency permit is
    /// acquired inside the task, so callers never wait on a full pool.
    ///
    /// After shutdown begins, new spawns are rejected (the task is dropped
    /// with a warning).
    pub fn spawn<F>(&self, name: &str, future: F) -> Option<TaskHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if *self.shutdown_tx.borrow() {
            warn!(task = name, "pool is shutting down; task rejected");
            return None;
        }

        let permits = self.permits.clone();
        let active = self.active.clone();
        let completed = self.completed.clone();
        let label = name.to_owned();

        active.fetch_add(1, Ordering::SeqCst);
        let join = tokio::spawn(async move {
            // A closed semaphore means shutdown raced us; just bail.
            let Ok(_permit) = permits.acquire_owned().await else {
                active.fetch_sub(1, Ordering::SeqCst);
                return;
            };
            future.await;
            active.fetch_sub(1, Ordering::SeqCst);
            completed.fetch_add(1, Ordering::SeqCst);
            debug!(task = %label, "background task finished");
        });

        Some(TaskHandle {
            name: name.to_owned(),
            join,
        })
    }

    /// A receiver of the shutdown flag for long-running workers.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Number of tasks currently running or queued for a permit.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Tasks finished since startup.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Begin shutdown and wait up to `grace` for in-flight tasks.
    ///
    /// Returns `true` when the pool drained in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let _ = self.shutdown_tx.send(true);
        let deadline = tokio::time::Instant::now()
            .checked_add(grace)
            .unwrap_or_else(tokio::time::Instant::now);

        while self.active() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(active = self.active(), "worker pool shutdown grace expired");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }
}
