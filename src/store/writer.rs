//! Single-writer actor for serialized SQLite writes.
//!
//! All database mutations flow through this actor via an
//! [`mpsc`](tokio::sync::mpsc) channel, preventing SQLite write contention
//! while reads stay concurrent through the pool. Each operation carries a
//! oneshot ack so callers observe their own writes.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;
use uuid::Uuid;

use crate::types::{
    FileRecord, Integration, Message, Notification, SessionStatus, Tenant, User,
};

use super::StoreError;

/// A mutation plus the ack channel for its outcome (rows affected).
pub(crate) type WriteRequest = (WriteOp, oneshot::Sender<Result<u64, StoreError>>);

/// Operations accepted by the write actor.
#[derive(Debug)]
pub(crate) enum WriteOp {
    /// Insert a tenant.
    InsertTenant(Tenant),
    /// Insert a user.
    InsertUser(User),
    /// Insert a session.
    InsertSession {
        /// The session row.
        id: Uuid,
        /// Owning tenant.
        tenant_id: Uuid,
        /// Owning user.
        user_id: Uuid,
        /// Display title.
        title: String,
        /// Serialized metadata bag.
        metadata_json: String,
        /// Creation timestamp.
        created_at: DateTime<Utc>,
    },
    /// Replace a session's metadata bag.
    UpdateSessionMetadata {
        /// Session id.
        id: Uuid,
        /// Owning tenant (all queries filter by it).
        tenant_id: Uuid,
        /// Serialized metadata bag.
        metadata_json: String,
    },
    /// Change a session's lifecycle status.
    SetSessionStatus {
        /// Session id.
        id: Uuid,
        /// Owning tenant.
        tenant_id: Uuid,
        /// New status.
        status: SessionStatus,
    },
    /// Append a message to a session.
    AppendMessage(Message),
    /// Insert a medium-term note row.
    InsertMediumNote {
        /// Note id (shared with its embedding).
        id: Uuid,
        /// Owning session.
        session_id: Uuid,
        /// Owning tenant.
        tenant_id: Uuid,
        /// Note content.
        content: String,
        /// Creation timestamp.
        created_at: DateTime<Utc>,
        /// Expiry timestamp.
        expires_at: DateTime<Utc>,
    },
    /// Delete medium-term notes past their expiry.
    DeleteExpiredMediumNotes {
        /// Cut-off instant.
        now: DateTime<Utc>,
    },
    /// Insert a long-term memory row.
    InsertLongMemory {
        /// Row id (shared with its embedding).
        id: Uuid,
        /// Owning tenant.
        tenant_id: Uuid,
        /// Owning user.
        user_id: Uuid,
        /// Content fingerprint.
        fingerprint: String,
        /// Content text.
        content: String,
        /// Importance in [0, 1].
        importance: f64,
        /// Serialized list of source session ids.
        learned_from_json: String,
        /// Creation timestamp.
        created_at: DateTime<Utc>,
    },
    /// Merge into an existing long-term row (duplicate fingerprint).
    MergeLongMemory {
        /// Existing row id.
        id: Uuid,
        /// New importance (caller already took the max).
        importance: f64,
        /// Serialized merged source session set.
        learned_from_json: String,
    },
    /// Delete long-term memory rows by id.
    DeleteLongMemories {
        /// Row ids.
        ids: Vec<Uuid>,
    },
    /// Insert a notification.
    InsertNotification(Notification),
    /// Mark notifications as read.
    MarkNotificationsRead {
        /// Notification ids.
        ids: Vec<Uuid>,
    },
    /// Resolve a notification with a resolution text.
    ResolveNotification {
        /// Notification id.
        id: Uuid,
        /// Resolution recorded into the payload.
        resolution: String,
        /// Resolution timestamp.
        resolved_at: DateTime<Utc>,
    },
    /// Delete notifications by id.
    DeleteNotifications {
        /// Notification ids.
        ids: Vec<Uuid>,
    },
    /// Insert or update an integration.
    UpsertIntegration {
        /// The integration.
        integration: Integration,
        /// Server URL extracted from metadata, part of the dedupe key.
        server_url: Option<String>,
    },
    /// Enable or disable an integration.
    SetIntegrationEnabled {
        /// Integration id.
        id: Uuid,
        /// Owning tenant.
        tenant_id: Uuid,
        /// New enabled flag.
        enabled: bool,
    },
    /// Insert a file record.
    InsertFile(FileRecord),
}

/// Run the single-writer actor loop.
///
/// Processes write requests until the sender half is dropped, acking each
/// with the number of rows affected.
pub(crate) async fn run_writer(db: SqlitePool, mut rx: mpsc::Receiver<WriteRequest>) {
    while let Some((op, ack)) = rx.recv().await {
        let result = handle_op(&db, op).await;
        // A dropped ack just means the caller went away.
        let _ = ack.send(result);
    }
    trace!("store writer actor stopped");
}

async fn handle_op(db: &SqlitePool, op: WriteOp) -> Result<u64, StoreError> {
    let result = match op {
        WriteOp::InsertTenant(t) => {
            sqlx::query("INSERT INTO tenants (id, name, schema_tag, active) VALUES (?1, ?2, ?3, ?4)")
                .bind(t.id.to_string())
                .bind(&t.name)
                .bind(&t.schema_tag)
                .bind(i32::from(t.active))
                .execute(db)
                .await?
        }

        WriteOp::InsertUser(u) => {
            sqlx::query(
                "INSERT INTO users (id, tenant_id, email, role, active, verified) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(u.id.to_string())
            .bind(u.tenant_id.to_string())
            .bind(&u.email)
            .bind(u.role.as_str())
            .bind(i32::from(u.active))
            .bind(i32::from(u.verified))
            .execute(db)
            .await?
        }

        WriteOp::InsertSession {
            id,
            tenant_id,
            user_id,
            title,
            metadata_json,
            created_at,
        } => {
            sqlx::query(
                "INSERT INTO sessions \
                 (id, tenant_id, user_id, title, status, metadata, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6, ?6)",
            )
            .bind(id.to_string())
            .bind(tenant_id.to_string())
            .bind(user_id.to_string())
            .bind(&title)
            .bind(&metadata_json)
            .bind(created_at.to_rfc3339())
            .execute(db)
            .await?
        }

        WriteOp::UpdateSessionMetadata {
            id,
            tenant_id,
            metadata_json,
        } => {
            sqlx::query(
                "UPDATE sessions SET metadata = ?1, updated_at = ?2 \
                 WHERE id = ?3 AND tenant_id = ?4",
            )
            .bind(&metadata_json)
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .bind(tenant_id.to_string())
            .execute(db)
            .await?
        }

        WriteOp::SetSessionStatus {
            id,
            tenant_id,
            status,
        } => {
            sqlx::query(
                "UPDATE sessions SET status = ?1, updated_at = ?2 \
                 WHERE id = ?3 AND tenant_id = ?4",
            )
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .bind(tenant_id.to_string())
            .execute(db)
            .await?
        }

        WriteOp::AppendMessage(m) => {
            let tool_calls = m.tool_calls.as_ref().map(ToString::to_string);
            sqlx::query(
                "INSERT INTO messages \
                 (id, session_id, tenant_id, role, content, tool_calls, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .bind(m.id.to_string())
            .bind(m.session_id.to_string())
            .bind(m.tenant_id.to_string())
            .bind(m.role.as_str())
            .bind(&m.content)
            .bind(tool_calls)
            .bind(m.created_at.to_rfc3339())
            .execute(db)
            .await?
        }

        WriteOp::InsertMediumNote {
            id,
            session_id,
            tenant_id,
            content,
            created_at,
            expires_at,
        } => {
            sqlx::query(
                "INSERT INTO memories_medium \
                 (id, session_id, tenant_id, content, created_at, expires_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(id.to_string())
            .bind(session_id.to_string())
            .bind(tenant_id.to_string())
            .bind(&content)
            .bind(created_at.to_rfc3339())
            .bind(expires_at.to_rfc3339())
            .execute(db)
            .await?
        }

        WriteOp::DeleteExpiredMediumNotes { now } => {
            sqlx::query("DELETE FROM memories_medium WHERE expires_at <= ?1")
                .bind(now.to_rfc3339())
                .execute(db)
                .await?
        }

        WriteOp::InsertLongMemory {
            id,
            tenant_id,
            user_id,
            fingerprint,
            content,
            importance,
            learned_from_json,
            created_at,
        } => {
            sqlx::query(
                "INSERT INTO memories_long \
                 (id, tenant_id, user_id, fingerprint, content, importance, learned_from, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .bind(id.to_string())
            .bind(tenant_id.to_string())
            .bind(user_id.to_string())
            .bind(&fingerprint)
            .bind(&content)
            .bind(importance)
            .bind(&learned_from_json)
            .bind(created_at.to_rfc3339())
            .execute(db)
            .await?
        }

        WriteOp::MergeLongMemory {
            id,
            importance,
            learned_from_json,
        } => {
            sqlx::query(
                "UPDATE memories_long SET importance = ?1, learned_from = ?2 WHERE id = ?3",
            )
            .bind(importance)
            .bind(&learned_from_json)
            .bind(id.to_string())
            .execute(db)
            .await?
        }

        WriteOp::DeleteLongMemories { ids } => {
            let mut affected = 0u64;
            for id in ids {
                let result = sqlx::query("DELETE FROM memories_long WHERE id = ?1")
                    .bind(id.to_string())
                    .execute(db)
                    .await?;
                affected = affected.saturating_add(result.rows_affected());
            }
            trace!(affected, "long-term memories deleted");
            return Ok(affected);
        }

        WriteOp::InsertNotification(n) => {
            sqlx::query(
                "INSERT INTO notifications \
                 (id, tenant_id, user_id, session_id, kind, priority, channel, payload, \
                  reference_id, read, resolved_at, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )
            .bind(n.id.to_string())
            .bind(n.tenant_id.to_string())
            .bind(n.user_id.to_string())
            .bind(n.session_id.map(|s| s.to_string()))
            .bind(&n.kind)
            .bind(n.priority.as_str())
            .bind(n.channel.as_str())
            .bind(n.payload.to_string())
            .bind(n.reference_id.as_deref())
            .bind(i32::from(n.read))
            .bind(n.resolved_at.map(|t| t.to_rfc3339()))
            .bind(n.created_at.to_rfc3339())
            .execute(db)
            .await?
        }

        WriteOp::MarkNotificationsRead { ids } => {
            let mut affected = 0u64;
            for id in ids {
                let result = sqlx::query("UPDATE notifications SET read = 1 WHERE id = ?1")
                    .bind(id.to_string())
                    .execute(db)
                    .await?;
                affected = affected.saturating_add(result.rows_affected());
            }
            return Ok(affected);
        }

        WriteOp::ResolveNotification {
            id,
            resolution,
            resolved_at,
        } => {
            sqlx::query(
                "UPDATE notifications \
                 SET resolved_at = ?1, read = 1, \
                     payload = json_set(payload, '$.resolution', ?2) \
                 WHERE id = ?3",
            )
            .bind(resolved_at.to_rfc3339())
            .bind(&resolution)
            .bind(id.to_string())
            .execute(db)
            .await?
        }

        WriteOp::DeleteNotifications { ids } => {
            let mut affected = 0u64;
            for id in ids {
                let result = sqlx::query("DELETE FROM notifications WHERE id = ?1")
                    .bind(id.to_string())
                    .execute(db)
                    .await?;
                affected = affected.saturating_add(result.rows_affected());
            }
            return Ok(affected);
        }

        WriteOp::UpsertIntegration {
            integration: i,
            server_url,
        } => {
            use base64::Engine as _;
            let credentials =
                base64::engine::general_purpose::STANDARD.encode(&i.encrypted_credentials);
            sqlx::query(
                "INSERT INTO integrations \
                 (id, tenant_id, user_id, service, server_url, enabled, credentials, metadata) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT(tenant_id, user_id, service, server_url) DO UPDATE SET \
                   enabled = excluded.enabled, \
                   credentials = excluded.credentials, \
                   metadata = excluded.metadata",
            )
            .bind(i.id.to_string())
            .bind(i.tenant_id.to_string())
            .bind(i.user_id.to_string())
            .bind(i.service.as_str())
            .bind(server_url.unwrap_or_default())
            .bind(i32::from(i.enabled))
            .bind(&credentials)
            .bind(i.metadata.to_string())
            .execute(db)
            .await?
        }

        WriteOp::SetIntegrationEnabled {
            id,
            tenant_id,
            enabled,
        } => {
            sqlx::query("UPDATE integrations SET enabled = ?1 WHERE id = ?2 AND tenant_id = ?3")
                .bind(i32::from(enabled))
                .bind(id.to_string())
                .bind(tenant_id.to_string())
                .execute(db)
                .await?
        }

        WriteOp::InsertFile(f) => {
            sqlx::query(
                "INSERT INTO files \
                 (id, tenant_id, user_id, session_id, name, mime, storage_ref, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .bind(f.id.to_string())
            .bind(f.tenant_id.to_string())
            .bind(f.user_id.to_string())
            .bind(f.session_id.map(|s| s.to_string()))
            .bind(&f.name)
            .bind(&f.mime)
            .bind(&f.storage_ref)
            .bind(f.created_at.to_rfc3339())
            .execute(db)
            .await?
        }
    };

    Ok(result.rows_affected())
}
