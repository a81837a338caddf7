//! Calendar watcher.
//!
//! For each enabled calendar integration, lists events starting within
//! the next two hours and emits a `medium` reminder 15 minutes before
//! start and a `high` reminder 5 minutes before start. A per-event
//! reminder state prevents duplicates; entries are pruned once the event
//! has started.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::warn;

use crate::kernel::notify_user_payload;
use crate::scheduler::BackgroundAgent;
use crate::store::Store;
use crate::types::{Priority, ServiceKind, Task};

use super::CalendarProvider;

/// Horizon for event listing.
const LOOKAHEAD_MINS: i64 = 120;

/// Lead time of the early reminder.
const EARLY_REMINDER_MINS: i64 = 15;

/// Lead time of the final reminder.
const FINAL_REMINDER_MINS: i64 = 5;

#[derive(Debug, Default, Clone, Copy)]
struct ReminderState {
    early_sent: bool,
    final_sent: bool,
}

/// The calendar background watcher.
pub struct CalendarWatcher {
    store: Arc<Store>,
    provider: Arc<dyn CalendarProvider>,
    interval: Duration,
    /// Reminder state per event id, with the event start for pruning.
    reminded: Mutex<HashMap<String, (DateTime<Utc>, ReminderState)>>,
}

impl std::fmt::Debug for CalendarWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalendarWatcher").finish_non_exhaustive()
    }
}

impl CalendarWatcher {
    /// Create the watcher.
    pub fn new(
        store: Arc<Store>,
        provider: Arc<dyn CalendarProvider>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            provider,
            interval,
            reminded: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait::async_trait]
impl BackgroundAgent for CalendarWatcher {
    fn name(&self) -> &'static str {
        "calendar_watcher"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn produce_tasks(&self) -> anyhow::Result<Vec<Task>> {
        let now = Utc::now();
        let horizon = now
            .checked_add_signed(chrono::Duration::minutes(LOOKAHEAD_MINS))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut tasks = Vec::new();

        for tenant in self.store.list_active_tenants().await? {
            let integrations = self
                .store
                .list_enabled_integrations(tenant.id, ServiceKind::Calendar)
                .await?;

            for integration in integrations {
                let events = match self
                    .provider
                    .list_events(&integration, now, horizon)
                    .await
                {
                    Ok(events) => events,
                    Err(err) => {
                        warn!(integration = %integration.id, error = %err, "calendar poll failed");
                        continue;
                    }
                };

                let mut reminded = self.reminded.lock().await;

                // Prune events that have already started.
                reminded.retain(|_, (start, _)| *start > now);

                for event in events {
                    if event.start <= now {
                        continue;
                    }
                    let lead = event.start.signed_duration_since(now);
                    let (_, state) = reminded
                        .entry(event.id.clone())
                        .or_insert((event.start, ReminderState::default()));

                    let reminder = if lead <= chrono::Duration::minutes(FINAL_REMINDER_MINS)
                        && !state.final_sent
                    {
                        // The final reminder supersedes an unsent early one.
                        state.final_sent = true;
                        state.early_sent = true;
                        Some((Priority::High, "final"))
                    } else if lead <= chrono::Duration::minutes(EARLY_REMINDER_MINS)
                        && !state.early_sent
                    {
                        state.early_sent = true;
                        Some((Priority::Medium, "early"))
                    } else {
                        None
                    };

                    if let Some((priority, stage)) = reminder {
                        tasks.push(Task::new(
                            priority,
                            self.name(),
                            "notify_user",
                            notify_user_payload(
                                tenant.id,
                                integration.user_id,
                                "calendar_reminder",
                                priority,
                                Some(&format!("{}:{stage}", event.id)),
                                serde_json::json!({
                                    "event_id": event.id,
                                    "title": event.title,
                                    "start": event.start.to_rfc3339(),
                                    "stage": stage,
                                }),
                            ),
                        ));
                    }
                }
            }
        }

        Ok(tasks)
    }
}
