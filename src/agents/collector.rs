//! Notification collector node: the terminal response formatter.
//!
//! Drains the per-request notification buffer, publishes everything
//! through the notification center, and attaches a summary (total count
//! plus the high-priority list) to the response.

use std::sync::Arc;

use tracing::warn;

use crate::kernel::graph::{GraphCtx, Node};
use crate::kernel::state::{NotificationSummary, RequestState};
use crate::notify::NotificationCenter;
use crate::types::Priority;

/// Terminal node publishing buffered notifications and summarising them.
pub struct NotificationCollectorNode {
    center: Arc<NotificationCenter>,
}

impl NotificationCollectorNode {
    /// Create the node over the notification center.
    pub fn new(center: Arc<NotificationCenter>) -> Self {
        Self { center }
    }
}

#[async_trait::async_trait]
impl Node for NotificationCollectorNode {
    fn name(&self) -> &'static str {
        "respond"
    }

    async fn run(&self, mut state: RequestState, _ctx: &GraphCtx) -> RequestState {
        let buffered = std::mem::take(&mut state.notifications);
        let total = buffered.len();

        let mut high_priority = Vec::new();
        for notification in buffered {
            if notification.priority >= Priority::High {
                high_priority.push(notification.clone());
            }
            if let Err(err) = self.center.publish(notification).await {
                warn!(error = %err, "failed to publish buffered notification");
            }
        }

        state.notification_summary = Some(NotificationSummary {
            total,
            high_priority,
        });
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::notifications::NotificationFilter;
    use crate::store::Store;
    use crate::types::{Message, MessageRole, Notification, Session, SessionStatus};
    use crate::workers::WorkerPool;
    use chrono::Utc;
    use uuid::Uuid;

    fn state() -> RequestState {
        let tenant_id = Uuid::new_v4();
        let session = Session {
            id: Uuid::new_v4(),
            tenant_id,
            user_id: Uuid::new_v4(),
            title: "t".to_owned(),
            status: SessionStatus::Active,
            metadata: serde_json::Map::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let message = Message::new(session.id, tenant_id, MessageRole::User, "hi");
        RequestState::new(session, message)
    }

    fn ctx() -> GraphCtx {
        GraphCtx {
            workers: Arc::new(WorkerPool::new(2)),
        }
    }

    #[tokio::test]
    async fn test_collector_partitions_and_publishes() {
        let store = Arc::new(Store::open_in_memory().await.expect("open"));
        let center = Arc::new(NotificationCenter::new(store));
        let node = NotificationCollectorNode::new(center.clone());

        let mut s = state();
        let tenant = s.tenant_id;
        let user = s.user_id;
        for (kind, priority) in [
            ("info_thing", Priority::Info),
            ("urgent_thing", Priority::High),
            ("blocking_thing", Priority::Critical),
        ] {
            s.buffer_notification(Notification::new(
                tenant,
                user,
                kind,
                priority,
                serde_json::json!({}),
            ));
        }

        let out = node.run(s, &ctx()).await;
        let summary = out.notification_summary.expect("summary");
        assert_eq!(summary.total, 3);
        assert_eq!(summary.high_priority.len(), 2);
        assert!(out.notifications.is_empty(), "buffer drained");

        let stored = center
            .list(&NotificationFilter::for_user(tenant, user))
            .await
            .expect("list");
        assert_eq!(stored.len(), 3, "everything was published");
    }
}
