//! Notification center: classify, persist, stream.
//!
//! `publish` normalises a notification, coalesces duplicates inside a
//! 60-second window, stores the row, and pushes an incremental event to
//! any live subscriber of the owning user. Subscribers receive a snapshot
//! first, then incremental events, as JSON objects:
//!
//! - snapshot: `{"type":"notifications_snapshot","events":[...]}`
//! - incremental: `{"type":"notification","event":{...}}`

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::notifications::NotificationFilter;
use crate::store::{Store, StoreError};
use crate::types::{Channel, Notification};

/// Coalescing window for identical `(kind, user, reference)` triples.
const DEDUPE_WINDOW_SECS: i64 = 60;

/// Capacity of each per-user broadcast channel.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

/// Result of publishing a notification.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    /// Stored and streamed.
    Published(Notification),
    /// Coalesced onto an existing notification inside the window.
    Coalesced(Uuid),
}

/// A live subscription: the snapshot to send first, then the stream of
/// incremental events.
pub struct Subscription {
    /// Initial `notifications_snapshot` event.
    pub snapshot: serde_json::Value,
    /// Incremental `notification` events.
    pub events: BroadcastStream<serde_json::Value>,
}

/// Central notification service.
pub struct NotificationCenter {
    store: Arc<Store>,
    subscribers: Mutex<HashMap<Uuid, broadcast::Sender<serde_json::Value>>>,
}

impl std::fmt::Debug for NotificationCenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationCenter").finish_non_exhaustive()
    }
}

impl NotificationCenter {
    /// Create a center over the given store.
    pub fn new(store: Arc<Store>) -> Self {
        info!("notification center initialised");
        Self {
            store,
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Normalise, coalesce, persist and stream a notification.
    ///
    /// The channel is always re-derived from the priority. Notifications
    /// with the same `(kind, user, reference_id)` within the coalescing
    /// window collapse onto the earlier one.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn publish(
        &self,
        mut notification: Notification,
    ) -> Result<PublishOutcome, StoreError> {
        notification.channel = Channel::from_priority(notification.priority);
        notification.kind = notification.kind.trim().to_owned();

        if let Some(reference) = notification.reference_id.clone() {
            let since = notification
                .created_at
                .checked_sub_signed(chrono::Duration::seconds(DEDUPE_WINDOW_SECS))
                .unwrap_or(notification.created_at);
            if let Some(existing) = self
                .store
                .find_recent_duplicate(&notification.kind, notification.user_id, &reference, since)
                .await?
            {
                debug!(kind = %notification.kind, reference = %reference, "notification coalesced");
                return Ok(PublishOutcome::Coalesced(existing));
            }
        }

        self.store.insert_notification(notification.clone()).await?;

        // Best-effort push to a live subscriber of the owner.
        let event = serde_json::json!({
            "type": "notification",
            "event": &notification,
        });
        let subscribers = self.subscribers.lock().await;
        if let Some(sender) = subscribers.get(&notification.user_id) {
            // A lagging or gone receiver is not an error.
            let _ = sender.send(event);
        }

        Ok(PublishOutcome::Published(notification))
    }

    /// Subscribe to a user's notifications: a snapshot of the newest page
    /// plus a stream of incremental events.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be read.
    pub async fn subscribe(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> Result<Subscription, StoreError> {
        let current = self
            .store
            .list_notifications(&NotificationFilter::for_user(tenant_id, user_id))
            .await?;
        let snapshot = serde_json::json!({
            "type": "notifications_snapshot",
            "events": current,
        });

        let mut subscribers = self.subscribers.lock().await;
        let sender = subscribers
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_CHANNEL_CAPACITY).0);

        Ok(Subscription {
            snapshot,
            events: BroadcastStream::new(sender.subscribe()),
        })
    }

    /// Paged, filtered retrieval.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn list(
        &self,
        filter: &NotificationFilter,
    ) -> Result<Vec<Notification>, StoreError> {
        self.store.list_notifications(filter).await
    }

    /// Mark notifications as read.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn mark_read(&self, ids: &[Uuid]) -> Result<u64, StoreError> {
        self.store.mark_notifications_read(ids).await
    }

    /// Resolve a blocking notification with the user's resolution.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn resolve(&self, id: Uuid, resolution: &str) -> Result<(), StoreError> {
        self.store.resolve_notification(id, resolution).await
    }

    /// Delete notifications.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn delete(&self, ids: &[Uuid]) -> Result<u64, StoreError> {
        self.store.delete_notifications(ids).await
    }
}
