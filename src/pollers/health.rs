//! Service-health probes and the runtime health snapshot.
//!
//! A registry of probes is polled on the agent's interval. A status
//! transition is reported only after two consecutive confirming
//! observations (debounce), at the probe's severity. Each run also writes
//! a JSON health snapshot (uptime, queue depth, probe states) next to the
//! database.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::kernel::notify_user_payload;
use crate::queue::TaskQueue;
use crate::scheduler::BackgroundAgent;
use crate::types::{Priority, Task};

/// Consecutive confirming observations required before a transition is
/// reported.
const DEBOUNCE_COUNT: u8 = 2;

/// Observed health of a probed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeHealth {
    /// Operating normally.
    Healthy,
    /// Degraded but usable.
    Degraded,
    /// Not usable.
    Unhealthy,
}

/// A health probe over one resource.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Stable probe id.
    fn id(&self) -> &'static str;

    /// Human-readable resource name.
    fn resource(&self) -> &'static str;

    /// Notification priority for reported transitions.
    fn severity(&self) -> Priority;

    /// Observe the resource.
    async fn check(&self) -> ProbeHealth;
}

#[derive(Debug, Clone, Copy)]
struct ProbeState {
    reported: ProbeHealth,
    candidate: Option<(ProbeHealth, u8)>,
}

/// Snapshot written to `health.json`.
#[derive(Debug, Serialize)]
struct HealthReport {
    uptime_secs: u64,
    queue_pending: usize,
    queue_in_flight: usize,
    queue_dropped: u64,
    probes: HashMap<String, ProbeHealth>,
}

/// The service-health background agent.
pub struct ServiceHealthAgent {
    probes: Vec<Arc<dyn HealthProbe>>,
    states: Mutex<HashMap<&'static str, ProbeState>>,
    queue: Arc<TaskQueue>,
    interval: Duration,
    started: Instant,
    report_path: Option<PathBuf>,
    /// Transition notifications are addressed to the operator, when
    /// configured.
    owner: Option<(Uuid, Uuid)>,
}

impl std::fmt::Debug for ServiceHealthAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHealthAgent")
            .field("probes", &self.probes.len())
            .finish_non_exhaustive()
    }
}

impl ServiceHealthAgent {
    /// Create the agent. `owner` is the `(tenant, user)` receiving
    /// transition notifications; `report_path` the health snapshot
    /// location. Either may be absent.
    pub fn new(
        queue: Arc<TaskQueue>,
        interval: Duration,
        report_path: Option<PathBuf>,
        owner: Option<(Uuid, Uuid)>,
    ) -> Self {
        Self {
            probes: Vec::new(),
            states: Mutex::new(HashMap::new()),
            queue,
            interval,
            started: Instant::now(),
            report_path,
            owner,
        }
    }

    /// Register a probe. Probes start out reported healthy.
    pub fn register(&mut self, probe: Arc<dyn HealthProbe>) {
        self.probes.push(probe);
    }

    /// Feed one observation through the debounce state machine; returns
    /// the newly confirmed status on transition.
    fn observe(state: &mut ProbeState, observed: ProbeHealth) -> Option<ProbeHealth> {
        if observed == state.reported {
            state.candidate = None;
            return None;
        }
        match state.candidate {
            Some((candidate, count)) if candidate == observed => {
                let count = count.saturating_add(1);
                if count >= DEBOUNCE_COUNT {
                    state.reported = observed;
                    state.candidate = None;
                    return Some(observed);
                }
                state.candidate = Some((candidate, count));
                None
            }
            _ => {
                state.candidate = Some((observed, 1));
                None
            }
        }
    }

    fn write_report(&self, probes: &HashMap<&'static str, ProbeState>) {
        let Some(path) = &self.report_path else {
            return;
        };
        let stats = self.queue.stats();
        let report = HealthReport {
            uptime_secs: self.started.elapsed().as_secs(),
            queue_pending: stats.pending,
            queue_in_flight: stats.in_flight,
            queue_dropped: stats.dropped,
            probes: probes
                .iter()
                .map(|(id, state)| ((*id).to_owned(), state.reported))
                .collect(),
        };
        match serde_json::to_vec_pretty(&report) {
            Ok(bytes) => {
                if let Err(err) = std::fs::write(path, bytes) {
                    warn!(error = %err, path = %path.display(), "failed to write health report");
                }
            }
            Err(err) => warn!(error = %err, "failed to serialise health report"),
        }
    }
}

#[async_trait::async_trait]
impl BackgroundAgent for ServiceHealthAgent {
    fn name(&self) -> &'static str {
        "service_health"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn produce_tasks(&self) -> anyhow::Result<Vec<Task>> {
        let mut tasks = Vec::new();
        let mut states = self.states.lock().await;

        for probe in &self.probes {
            let observed = probe.check().await;
            let state = states.entry(probe.id()).or_insert(ProbeState {
                reported: ProbeHealth::Healthy,
                candidate: None,
            });

            if let Some(confirmed) = Self::observe(state, observed) {
                info!(
                    probe = probe.id(),
                    resource = probe.resource(),
                    status = ?confirmed,
                    "health transition confirmed"
                );
                if let Some((tenant_id, user_id)) = self.owner {
                    let priority = match confirmed {
                        ProbeHealth::Healthy => Priority::Info,
                        _ => probe.severity(),
                    };
                    tasks.push(Task::new(
                        priority,
                        self.name(),
                        "notify_user",
                        notify_user_payload(
                            tenant_id,
                            user_id,
                            "service_health_changed",
                            priority,
                            Some(&format!("{}:{:?}", probe.id(), confirmed)),
                            serde_json::json!({
                                "probe": probe.id(),
                                "resource": probe.resource(),
                                "status": confirmed,
                            }),
                        ),
                    ));
                }
            }
        }

        self.write_report(&states);
        Ok(tasks)
    }
}
