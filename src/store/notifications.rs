//! Notification persistence.
//!
//! Row-level storage and filtered retrieval; coalescing windows, channel
//! assignment and live streaming live in [`crate::notify`].

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::types::{Channel, Notification, Priority};

use super::writer::WriteOp;
use super::{parse_timestamp, parse_uuid, Store, StoreError};

/// Filters for notification retrieval. Tenant and user are mandatory;
/// everything else narrows the page.
#[derive(Debug, Clone)]
pub struct NotificationFilter {
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// Restrict to a session.
    pub session_id: Option<Uuid>,
    /// Restrict to a minimum urgency.
    pub min_priority: Option<Priority>,
    /// Restrict by read flag.
    pub read: Option<bool>,
    /// Page size.
    pub limit: usize,
    /// Page offset.
    pub offset: usize,
}

impl NotificationFilter {
    /// A filter returning the newest page for a user.
    pub fn for_user(tenant_id: Uuid, user_id: Uuid) -> Self {
        Self {
            tenant_id,
            user_id,
            session_id: None,
            min_priority: None,
            read: None,
            limit: 50,
            offset: 0,
        }
    }
}

#[derive(sqlx::FromRow)]
struct NotificationRow {
    id: String,
    tenant_id: String,
    user_id: String,
    session_id: Option<String>,
    kind: String,
    priority: String,
    channel: String,
    payload: String,
    reference_id: Option<String>,
    read: i64,
    resolved_at: Option<String>,
    created_at: String,
}

impl Store {
    /// Insert a notification row.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn insert_notification(&self, notification: Notification) -> Result<(), StoreError> {
        self.execute(WriteOp::InsertNotification(notification))
            .await?;
        Ok(())
    }

    /// Find a recent notification with the same `(kind, user_id,
    /// reference_id)`, created at or after `since`. Used for coalescing.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn find_recent_duplicate(
        &self,
        kind: &str,
        user_id: Uuid,
        reference_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Uuid>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM notifications \
             WHERE kind = ?1 AND user_id = ?2 AND reference_id = ?3 AND created_at >= ?4 \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(kind)
        .bind(user_id.to_string())
        .bind(reference_id)
        .bind(since.to_rfc3339())
        .fetch_optional(self.pool())
        .await?;

        row.map(|(id,)| parse_uuid(&id)).transpose()
    }

    /// Paged, filtered retrieval, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or corrupt rows.
    pub async fn list_notifications(
        &self,
        filter: &NotificationFilter,
    ) -> Result<Vec<Notification>, StoreError> {
        // The session placeholder is always present so the bind count is
        // fixed; an empty string means "no session filter".
        let mut sql = String::from(
            "SELECT id, tenant_id, user_id, session_id, kind, priority, channel, payload, \
                    reference_id, read, resolved_at, created_at \
             FROM notifications \
             WHERE tenant_id = ?1 AND user_id = ?2 \
               AND (?3 = '' OR session_id = ?3)",
        );
        if let Some(read) = filter.read {
            sql.push_str(if read { " AND read = 1" } else { " AND read = 0" });
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?4 OFFSET ?5");

        let limit = i64::try_from(filter.limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(filter.offset).unwrap_or(0);

        let rows: Vec<NotificationRow> = sqlx::query_as(&sql)
            .bind(filter.tenant_id.to_string())
            .bind(filter.user_id.to_string())
            .bind(filter.session_id.map(|s| s.to_string()).unwrap_or_default())
            .bind(limit)
            .bind(offset)
            .fetch_all(self.pool())
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let n = notification_from_row(row)?;
            if let Some(min) = filter.min_priority {
                if n.priority < min {
                    continue;
                }
            }
            out.push(n);
        }
        Ok(out)
    }

    /// Mark notifications as read; returns the number updated.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn mark_notifications_read(&self, ids: &[Uuid]) -> Result<u64, StoreError> {
        self.execute(WriteOp::MarkNotificationsRead { ids: ids.to_vec() })
            .await
    }

    /// Resolve a notification, recording the resolution text in its payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn resolve_notification(
        &self,
        id: Uuid,
        resolution: &str,
    ) -> Result<(), StoreError> {
        self.execute(WriteOp::ResolveNotification {
            id,
            resolution: resolution.to_owned(),
            resolved_at: Utc::now(),
        })
        .await?;
        Ok(())
    }

    /// Delete notifications by id; returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete_notifications(&self, ids: &[Uuid]) -> Result<u64, StoreError> {
        self.execute(WriteOp::DeleteNotifications { ids: ids.to_vec() })
            .await
    }
}

fn notification_from_row(row: NotificationRow) -> Result<Notification, StoreError> {
    let payload = serde_json::from_str(&row.payload)
        .map_err(|e| StoreError::Corrupt(format!("bad notification payload: {e}")))?;
    let session_id = row
        .session_id
        .filter(|s| !s.is_empty())
        .as_deref()
        .map(parse_uuid)
        .transpose()?;
    let resolved_at = row
        .resolved_at
        .as_deref()
        .map(parse_timestamp)
        .transpose()?;
    Ok(Notification {
        id: parse_uuid(&row.id)?,
        tenant_id: parse_uuid(&row.tenant_id)?,
        user_id: parse_uuid(&row.user_id)?,
        session_id,
        kind: row.kind,
        priority: Priority::parse(&row.priority)?,
        channel: Channel::parse(&row.channel)?,
        payload,
        reference_id: row.reference_id,
        read: row.read != 0,
        resolved_at,
        created_at: parse_timestamp(&row.created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(tenant_id: Uuid, user_id: Uuid, kind: &str, priority: Priority) -> Notification {
        Notification::new(tenant_id, user_id, kind, priority, serde_json::json!({}))
    }

    #[tokio::test]
    async fn test_insert_and_list() {
        let store = Store::open_in_memory().await.expect("open");
        let tenant_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        for p in [Priority::Info, Priority::High, Priority::Critical] {
            store
                .insert_notification(notification(tenant_id, user_id, "probe", p))
                .await
                .expect("insert");
        }

        let all = store
            .list_notifications(&NotificationFilter::for_user(tenant_id, user_id))
            .await
            .expect("list");
        assert_eq!(all.len(), 3);

        let mut high_only = NotificationFilter::for_user(tenant_id, user_id);
        high_only.min_priority = Some(Priority::High);
        let urgent = store.list_notifications(&high_only).await.expect("list");
        assert_eq!(urgent.len(), 2);
    }

    #[tokio::test]
    async fn test_mark_read_and_filter() {
        let store = Store::open_in_memory().await.expect("open");
        let tenant_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        let n = notification(tenant_id, user_id, "email_received", Priority::Medium);
        let id = n.id;
        store.insert_notification(n).await.expect("insert");

        let updated = store.mark_notifications_read(&[id]).await.expect("mark");
        assert_eq!(updated, 1);

        let mut unread = NotificationFilter::for_user(tenant_id, user_id);
        unread.read = Some(false);
        assert!(store
            .list_notifications(&unread)
            .await
            .expect("list")
            .is_empty());
    }

    #[tokio::test]
    async fn test_resolve_records_resolution() {
        let store = Store::open_in_memory().await.expect("open");
        let tenant_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        let n = notification(tenant_id, user_id, "contradiction_detected", Priority::Critical);
        let id = n.id;
        store.insert_notification(n).await.expect("insert");

        store
            .resolve_notification(id, "choose_a")
            .await
            .expect("resolve");

        let all = store
            .list_notifications(&NotificationFilter::for_user(tenant_id, user_id))
            .await
            .expect("list");
        assert_eq!(all.len(), 1);
        assert!(all[0].resolved_at.is_some());
        assert_eq!(all[0].payload["resolution"], "choose_a");
    }

    #[tokio::test]
    async fn test_find_recent_duplicate_window() {
        let store = Store::open_in_memory().await.expect("open");
        let tenant_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        let n = notification(tenant_id, user_id, "email_received", Priority::Low)
            .with_reference("msg_42");
        store.insert_notification(n).await.expect("insert");

        let since = Utc::now() - chrono::Duration::seconds(60);
        let hit = store
            .find_recent_duplicate("email_received", user_id, "msg_42", since)
            .await
            .expect("query");
        assert!(hit.is_some());

        let miss = store
            .find_recent_duplicate("email_received", user_id, "msg_43", since)
            .await
            .expect("query");
        assert!(miss.is_none());
    }
}
