//! Priority task queue shared across agents.
//!
//! Fairness is FIFO within each priority class. Scheduled tasks stay
//! hidden until `visible_after`. Consumers hold a lease while a task is in
//! flight; an un-completed task whose lease expires is reclaimed so a
//! second consumer can take it. Above a soft cap, `info` and `low` tasks
//! are shed; `medium` and higher are always kept.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{Priority, Task, TaskStatus};

/// Fallback wake interval for consumers, bounding the wait between
/// eligibility re-checks.
const DEQUEUE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Priority classes from highest to lowest, the dequeue scan order.
const PRIORITY_SCAN: [Priority; 5] = [
    Priority::Critical,
    Priority::High,
    Priority::Medium,
    Priority::Low,
    Priority::Info,
];

/// Errors from queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// `complete` was called for a task the queue is not holding in flight.
    #[error("unknown or already completed task: {0}")]
    UnknownTask(Uuid),

    /// `complete` was called with a non-terminal status.
    #[error("completion requires a terminal status, got {0:?}")]
    NotTerminal(TaskStatus),
}

/// Outcome of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The task was accepted.
    Enqueued,
    /// The task was shed by backpressure.
    Dropped,
}

/// Queue depth and shedding counters, for health reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Tasks waiting to be consumed.
    pub pending: usize,
    /// Tasks currently leased to consumers.
    pub in_flight: usize,
    /// Tasks shed by backpressure since startup.
    pub dropped: u64,
}

struct Leased {
    task: Task,
    leased_until: DateTime<Utc>,
}

#[derive(Default)]
struct QueueInner {
    /// FIFO queues per priority class.
    pending: HashMap<Priority, VecDeque<Task>>,
    /// Tasks handed to consumers, pending `complete`.
    in_flight: HashMap<Uuid, Leased>,
}

impl QueueInner {
    fn pending_len(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    /// Return expired leases to the front of their class.
    fn reclaim_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, leased)| leased.leased_until <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(mut leased) = self.in_flight.remove(&id) {
                warn!(task_id = %id, "lease expired; reclaiming task");
                leased.task.status = TaskStatus::Pending;
                self.pending
                    .entry(leased.task.priority)
                    .or_default()
                    .push_front(leased.task);
            }
        }
    }

    /// Pop the highest-priority task whose `visible_after` has passed,
    /// preserving FIFO order inside each class.
    fn pop_eligible(&mut self, now: DateTime<Utc>) -> Option<Task> {
        for priority in PRIORITY_SCAN {
            if let Some(class) = self.pending.get_mut(&priority) {
                let position = class
                    .iter()
                    .position(|task| task.visible_after.is_none_or(|at| at <= now));
                if let Some(position) = position {
                    return class.remove(position);
                }
            }
        }
        None
    }
}

/// In-process priority queue with leases and backpressure.
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    soft_cap: usize,
    lease: chrono::Duration,
    dropped: AtomicU64,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("soft_cap", &self.soft_cap)
            .finish_non_exhaustive()
    }
}

impl TaskQueue {
    /// Create a queue with the given soft cap and consumer lease.
    pub fn new(soft_cap: usize, lease_secs: u64) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            soft_cap,
            lease: chrono::Duration::seconds(i64::try_from(lease_secs).unwrap_or(300)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a task. Non-blocking.
    ///
    /// Above the soft cap, `info` and `low` tasks are shed with a counter
    /// increment; `medium` and higher are always accepted.
    pub fn enqueue(&self, task: Task) -> EnqueueOutcome {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if inner.pending_len() >= self.soft_cap && task.priority <= Priority::Low {
            drop(inner);
            let total = self.dropped.fetch_add(1, Ordering::Relaxed).saturating_add(1);
            debug!(priority = task.priority.as_str(), total, "task shed by backpressure");
            return EnqueueOutcome::Dropped;
        }

        inner.pending.entry(task.priority).or_default().push_back(task);
        drop(inner);
        self.notify.notify_one();
        EnqueueOutcome::Enqueued
    }

    /// Enqueue several tasks atomically under one lock (the scheduler's
    /// handlers hand their batch over in one go). Backpressure still
    /// applies per task.
    pub fn enqueue_batch(&self, tasks: Vec<Task>) -> usize {
        let mut accepted = 0usize;
        {
            let mut inner = match self.inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            for task in tasks {
                if inner.pending_len() >= self.soft_cap && task.priority <= Priority::Low {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                inner.pending.entry(task.priority).or_default().push_back(task);
                accepted = accepted.saturating_add(1);
            }
        }
        for _ in 0..accepted {
            self.notify.notify_one();
        }
        accepted
    }

    /// Dequeue the highest-priority eligible task, waiting until one is
    /// available.
    ///
    /// Never returns a task whose `visible_after` lies in the future. The
    /// returned task is leased; callers must finish with
    /// [`TaskQueue::complete`]. Cancellation is safe: dropping the future
    /// leaves the queue intact and another consumer may take the task.
    pub async fn dequeue(&self) -> Task {
        loop {
            {
                let mut inner = match self.inner.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                let now = Utc::now();
                inner.reclaim_expired(now);
                if let Some(mut task) = inner.pop_eligible(now) {
                    task.status = TaskStatus::InFlight;
                    let leased_until = now
                        .checked_add_signed(self.lease)
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    inner.in_flight.insert(
                        task.id,
                        Leased {
                            task: task.clone(),
                            leased_until,
                        },
                    );
                    return task;
                }
            }

            // Bounded wait: a notify can be consumed by a cancelled peer,
            // and scheduled tasks become eligible silently.
            tokio::select! {
                () = self.notify.notified() => {}
                () = tokio::time::sleep(DEQUEUE_POLL_INTERVAL) => {}
            }
        }
    }

    /// Transition a leased task to a terminal status.
    ///
    /// # Errors
    ///
    /// Returns an error if the task is not in flight or the status is not
    /// terminal.
    pub fn complete(&self, task_id: Uuid, status: TaskStatus) -> Result<Task, QueueError> {
        if !status.is_terminal() {
            return Err(QueueError::NotTerminal(status));
        }
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut leased = inner
            .in_flight
            .remove(&task_id)
            .ok_or(QueueError::UnknownTask(task_id))?;
        leased.task.status = status;
        Ok(leased.task)
    }

    /// Current depth and shedding counters.
    pub fn stats(&self) -> QueueStats {
        let inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        QueueStats {
            pending: inner.pending_len(),
            in_flight: inner.in_flight.len(),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(priority: Priority, label: &str) -> Task {
        Task::new(priority, "test", label, serde_json::json!({}))
    }

    #[tokio::test]
    async fn test_priority_order_with_fifo_within_class() {
        let queue = TaskQueue::new(100, 300);
        queue.enqueue(task(Priority::Low, "A"));
        queue.enqueue(task(Priority::High, "B"));
        queue.enqueue(task(Priority::Medium, "C"));
        queue.enqueue(task(Priority::High, "D"));

        let order: Vec<String> = [
            queue.dequeue().await,
            queue.dequeue().await,
            queue.dequeue().await,
            queue.dequeue().await,
        ]
        .iter()
        .map(|t| t.kind.clone())
        .collect();

        assert_eq!(order, ["B", "D", "C", "A"]);
    }

    #[tokio::test]
    async fn test_dequeue_blocks_until_enqueue() {
        let queue = std::sync::Arc::new(TaskQueue::new(100, 300));

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };

        // Give the consumer a moment to park.
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.enqueue(task(Priority::Medium, "wake"));

        let got = tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .expect("consumer should wake")
            .expect("join");
        assert_eq!(got.kind, "wake");
        assert_eq!(got.status, TaskStatus::InFlight);
    }

    #[tokio::test]
    async fn test_scheduled_task_hidden_until_visible() {
        let queue = TaskQueue::new(100, 300);
        let soon = Utc::now() + chrono::Duration::milliseconds(300);
        queue.enqueue(task(Priority::High, "later").scheduled_at(soon));
        queue.enqueue(task(Priority::Low, "now"));

        // The hidden high-priority task must not jump the queue.
        let first = queue.dequeue().await;
        assert_eq!(first.kind, "now");

        let second = queue.dequeue().await;
        assert_eq!(second.kind, "later");
        assert!(second.visible_after.is_some_and(|at| at <= Utc::now()));
    }

    #[tokio::test]
    async fn test_backpressure_sheds_low_keeps_critical() {
        let queue = TaskQueue::new(10, 300);
        for i in 0..20 {
            queue.enqueue(task(Priority::Info, &format!("info{i}")));
        }
        let stats = queue.stats();
        assert_eq!(stats.pending, 10, "soft cap bounds info tasks");
        assert_eq!(stats.dropped, 10);

        // Critical is accepted even above the cap.
        assert_eq!(
            queue.enqueue(task(Priority::Critical, "must-keep")),
            EnqueueOutcome::Enqueued
        );
        assert_eq!(queue.stats().pending, 11);
    }

    #[tokio::test]
    async fn test_complete_transitions_and_rejects_unknown() {
        let queue = TaskQueue::new(100, 300);
        queue.enqueue(task(Priority::Medium, "work"));

        let leased = queue.dequeue().await;
        let done = queue
            .complete(leased.id, TaskStatus::Completed)
            .expect("complete");
        assert_eq!(done.status, TaskStatus::Completed);

        assert!(matches!(
            queue.complete(leased.id, TaskStatus::Completed),
            Err(QueueError::UnknownTask(_))
        ));
        assert!(matches!(
            queue.complete(Uuid::new_v4(), TaskStatus::Pending),
            Err(QueueError::NotTerminal(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        // Zero-second lease: the task is reclaimable immediately.
        let queue = TaskQueue::new(100, 0);
        queue.enqueue(task(Priority::High, "crashy"));

        let first = queue.dequeue().await;
        assert_eq!(first.kind, "crashy");

        // The first consumer never completes; a second takes it over.
        let second = queue.dequeue().await;
        assert_eq!(second.id, first.id);
        assert_eq!(queue.stats().in_flight, 1);
    }
}
