//! Email poller.
//!
//! For each enabled email integration, fetches unread messages of the
//! last 24 hours and dedupes them against an in-memory `last_seen_id`.
//! The first run of an integration keeps only the 5 newest messages so a
//! full mailbox does not flood the user. Priority: `high` when the
//! subject carries an urgency token, `medium` when the message is younger
//! than 5 minutes, `low` otherwise. One notification task per new
//! message.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::kernel::notify_user_payload;
use crate::scheduler::BackgroundAgent;
use crate::store::Store;
use crate::types::{Priority, ServiceKind, Task};

use super::{EmailMessage, EmailProvider};

/// Look-back window for unread mail.
const LOOKBACK_HOURS: i64 = 24;

/// Messages kept on an integration's first poll.
const BOOTSTRAP_LIMIT: usize = 5;

/// Fetch ceiling per poll.
const FETCH_LIMIT: usize = 50;

/// A message younger than this is at least `medium` priority.
const FRESH_WINDOW_MINS: i64 = 5;

/// The email background poller.
pub struct EmailPoller {
    store: Arc<Store>,
    provider: Arc<dyn EmailProvider>,
    interval: Duration,
    urgency_tokens: Vec<String>,
    /// Per-integration high-water mark; updates are monotonic in poll
    /// order (newer polls only ever move it forward).
    last_seen: Mutex<HashMap<Uuid, String>>,
}

impl std::fmt::Debug for EmailPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailPoller").finish_non_exhaustive()
    }
}

impl EmailPoller {
    /// Create the poller.
    pub fn new(
        store: Arc<Store>,
        provider: Arc<dyn EmailProvider>,
        interval: Duration,
        urgency_tokens: Vec<String>,
    ) -> Self {
        Self {
            store,
            provider,
            interval,
            urgency_tokens: urgency_tokens
                .into_iter()
                .map(|t| t.to_lowercase())
                .collect(),
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Classify a message's notification priority.
    fn classify(&self, message: &EmailMessage) -> Priority {
        let subject = message.subject.to_lowercase();
        if self.urgency_tokens.iter().any(|t| subject.contains(t)) {
            return Priority::High;
        }
        let age = Utc::now().signed_duration_since(message.received_at);
        if age <= chrono::Duration::minutes(FRESH_WINDOW_MINS) {
            return Priority::Medium;
        }
        Priority::Low
    }

    /// Split off the messages not yet seen by this integration.
    ///
    /// `messages` is newest first. With no high-water mark (first run)
    /// only the newest [`BOOTSTRAP_LIMIT`] survive.
    fn fresh_slice<'a>(
        last_seen: Option<&str>,
        messages: &'a [EmailMessage],
    ) -> &'a [EmailMessage] {
        match last_seen {
            None => &messages[..messages.len().min(BOOTSTRAP_LIMIT)],
            Some(seen) => {
                let cut = messages
                    .iter()
                    .position(|m| m.id == seen)
                    .unwrap_or(messages.len());
                &messages[..cut]
            }
        }
    }
}

#[async_trait::async_trait]
impl BackgroundAgent for EmailPoller {
    fn name(&self) -> &'static str {
        "email_poller"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn produce_tasks(&self) -> anyhow::Result<Vec<Task>> {
        let since = Utc::now() - chrono::Duration::hours(LOOKBACK_HOURS);
        let mut tasks = Vec::new();

        for tenant in self.store.list_active_tenants().await? {
            let integrations = self
                .store
                .list_enabled_integrations(tenant.id, ServiceKind::Email)
                .await?;

            for integration in integrations {
                let messages = match self
                    .provider
                    .list_unread(&integration, since, FETCH_LIMIT)
                    .await
                {
                    Ok(messages) => messages,
                    Err(err) => {
                        warn!(integration = %integration.id, error = %err, "mailbox poll failed");
                        continue;
                    }
                };
                if messages.is_empty() {
                    continue;
                }

                let mut last_seen = self.last_seen.lock().await;
                let seen = last_seen.get(&integration.id).cloned();
                let fresh = Self::fresh_slice(seen.as_deref(), &messages);

                for message in fresh {
                    let priority = self.classify(message);
                    tasks.push(Task::new(
                        priority,
                        self.name(),
                        "notify_user",
                        notify_user_payload(
                            tenant.id,
                            integration.user_id,
                            "email_received",
                            priority,
                            Some(&message.id),
                            serde_json::json!({
                                "from": message.from,
                                "subject": message.subject,
                                "received_at": message.received_at.to_rfc3339(),
                            }),
                        ),
                    ));
                }

                // Advance the high-water mark to the newest message.
                if let Some(newest) = messages.first() {
                    last_seen.insert(integration.id, newest.id.clone());
                }
                debug!(
                    integration = %integration.id,
                    fresh = fresh.len(),
                    "mailbox polled"
                );
            }
        }

        Ok(tasks)
    }
}
