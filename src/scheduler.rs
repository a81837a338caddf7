//! Scheduled task manager.
//!
//! Holds a registry of background agents, each with its own interval. A
//! single scheduler loop wakes every tick, starts due agents (each in its
//! own task), and records `last_run` when a handler finishes. A handler
//! still running when it is next due is skipped (no overlap per agent)
//! and logged once it exceeds twice its interval. Produced tasks are
//! enqueued into the priority queue as one atomic batch.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::queue::TaskQueue;
use crate::types::Task;

/// A background agent driven by the scheduler.
#[async_trait::async_trait]
pub trait BackgroundAgent: Send + Sync {
    /// Registry name, unique per agent.
    fn name(&self) -> &'static str;

    /// How often the agent should run.
    fn interval(&self) -> Duration;

    /// One poll: detect work and return tasks for the queue.
    ///
    /// # Errors
    ///
    /// Errors are logged by the scheduler; the agent runs again next
    /// interval.
    async fn produce_tasks(&self) -> anyhow::Result<Vec<Task>>;
}

struct Slot {
    agent: Arc<dyn BackgroundAgent>,
    last_run: Option<Instant>,
    in_flight: Option<(Instant, JoinHandle<Vec<Task>>)>,
    overrun_logged: bool,
}

/// The scheduler service.
pub struct ScheduledTaskManager {
    agents: Vec<Arc<dyn BackgroundAgent>>,
    queue: Arc<TaskQueue>,
    tick: Duration,
    handler_timeout: Duration,
}

impl std::fmt::Debug for ScheduledTaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTaskManager")
            .field("agents", &self.agents.len())
            .finish_non_exhaustive()
    }
}

impl ScheduledTaskManager {
    /// Create a manager over the queue.
    pub fn new(queue: Arc<TaskQueue>, tick: Duration, handler_timeout: Duration) -> Self {
        Self {
            agents: Vec::new(),
            queue,
            tick: tick.max(Duration::from_millis(100)),
            handler_timeout,
        }
    }

    /// Register a background agent.
    pub fn register(&mut self, agent: Arc<dyn BackgroundAgent>) {
        info!(agent = agent.name(), interval = ?agent.interval(), "background agent registered");
        self.agents.push(agent);
    }

    /// Names of registered agents.
    pub fn agent_names(&self) -> Vec<&'static str> {
        self.agents.iter().map(|a| a.name()).collect()
    }

    /// Run the scheduler loop until the shutdown signal flips.
    ///
    /// On shutdown, in-flight handlers get up to the handler timeout to
    /// finish before being abandoned.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(agents = self.agents.len(), "scheduler started");

        let mut slots: Vec<Slot> = self
            .agents
            .iter()
            .map(|agent| Slot {
                agent: agent.clone(),
                last_run: None,
                in_flight: None,
                overrun_logged: false,
            })
            .collect();

        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick_once(&mut slots).await;
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.drain(&mut slots).await;
        info!("scheduler stopped");
    }

    /// One scheduler tick: reap finished handlers, start due ones.
    async fn tick_once(&self, slots: &mut Vec<Slot>) {
        let now = Instant::now();

        for slot in slots.iter_mut() {
            // Reap a finished handler and record its completion time.
            if let Some((started, handle)) = slot.in_flight.take() {
                if handle.is_finished() {
                    match handle.await {
                        Ok(tasks) => {
                            let produced = tasks.len();
                            let accepted = self.queue.enqueue_batch(tasks);
                            debug!(
                                agent = slot.agent.name(),
                                produced, accepted, "handler finished"
                            );
                        }
                        Err(err) => {
                            error!(agent = slot.agent.name(), error = %err, "handler crashed");
                        }
                    }
                    slot.last_run = Some(now);
                    slot.overrun_logged = false;
                } else {
                    // Still running: put it back, complain if overrunning.
                    let overrun_at = slot.agent.interval().saturating_mul(2);
                    if now.duration_since(started) >= overrun_at && !slot.overrun_logged {
                        warn!(
                            agent = slot.agent.name(),
                            running_for = ?now.duration_since(started),
                            "handler exceeds twice its interval; skipping new invocations"
                        );
                        slot.overrun_logged = true;
                    }
                    slot.in_flight = Some((started, handle));
                    continue;
                }
            }

            // Start the agent when due. Never overlaps: in_flight is None
            // here by construction.
            let due = slot
                .last_run
                .is_none_or(|last| now.duration_since(last) >= slot.agent.interval());
            if due {
                let agent = slot.agent.clone();
                let name = agent.name();
                debug!(agent = name, "starting handler");
                let handle = tokio::spawn(async move {
                    match agent.produce_tasks().await {
                        Ok(tasks) => tasks,
                        Err(err) => {
                            error!(agent = name, error = %err, "handler failed");
                            Vec::new()
                        }
                    }
                });
                slot.in_flight = Some((now, handle));
            }
        }
    }

    /// Give in-flight handlers the grace period, then abandon them.
    async fn drain(&self, slots: &mut Vec<Slot>) {
        let deadline = Instant::now()
            .checked_add(self.handler_timeout)
            .unwrap_or_else(Instant::now);

        for slot in slots.iter_mut() {
            if let Some((_, handle)) = slot.in_flight.take() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, handle).await {
                    Ok(Ok(tasks)) => {
                        self.queue.enqueue_batch(tasks);
                    }
                    Ok(Err(err)) => {
                        error!(agent = slot.agent.name(), error = %err, "handler crashed at shutdown");
                    }
                    Err(_) => {
                        warn!(agent = slot.agent.name(), "handler abandoned at shutdown");
                    }
                }
            }
        }
    }
}
