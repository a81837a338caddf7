//! Session and message persistence.
//!
//! Messages are append-only; the autoincrement `seq` column is the single
//! source of ordering, so retrieval is always in insertion order and a
//! cursor (`after_seq`) supports incremental reads.

use chrono::Utc;
use uuid::Uuid;

use crate::types::{Message, MessageRole, Session, SessionStatus};

use super::writer::WriteOp;
use super::{parse_timestamp, parse_uuid, Store, StoreError};

/// A message together with its insertion sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    /// Monotonic insertion sequence within the database.
    pub seq: i64,
    /// The message.
    pub message: Message,
}

type SessionRow = (String, String, String, String, String, String, String, String);
type MessageRow = (i64, String, String, String, String, String, Option<String>, String);

impl Store {
    /// Create a session for a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn create_session(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        title: &str,
    ) -> Result<Session, StoreError> {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            tenant_id,
            user_id,
            title: title.to_owned(),
            status: SessionStatus::Active,
            metadata: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        };

        self.execute(WriteOp::InsertSession {
            id: session.id,
            tenant_id,
            user_id,
            title: session.title.clone(),
            metadata_json: "{}".to_owned(),
            created_at: now,
        })
        .await?;

        Ok(session)
    }

    /// Fetch a session by id within a tenant.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or corrupt rows.
    pub async fn get_session(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Session>, StoreError> {
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT id, tenant_id, user_id, title, status, metadata, created_at, updated_at \
             FROM sessions WHERE tenant_id = ?1 AND id = ?2",
        )
        .bind(tenant_id.to_string())
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;

        row.map(session_from_row).transpose()
    }

    /// Replace a session's metadata bag (used to persist the pending plan).
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn update_session_metadata(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        metadata: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), StoreError> {
        let metadata_json = serde_json::Value::Object(metadata.clone()).to_string();
        self.execute(WriteOp::UpdateSessionMetadata {
            id,
            tenant_id,
            metadata_json,
        })
        .await?;
        Ok(())
    }

    /// Archive a session (soft delete: messages and medium-term notes are
    /// kept).
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn archive_session(&self, tenant_id: Uuid, id: Uuid) -> Result<(), StoreError> {
        self.execute(WriteOp::SetSessionStatus {
            id,
            tenant_id,
            status: SessionStatus::Archived,
        })
        .await?;
        Ok(())
    }

    /// Append a message to its session.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn append_message(&self, message: Message) -> Result<(), StoreError> {
        self.execute(WriteOp::AppendMessage(message)).await?;
        Ok(())
    }

    /// List messages of a session in insertion order, starting after the
    /// given cursor (`after_seq = 0` reads from the beginning).
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or corrupt rows.
    pub async fn list_messages(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT seq, id, session_id, tenant_id, role, content, tool_calls, created_at \
             FROM messages \
             WHERE tenant_id = ?1 AND session_id = ?2 AND seq > ?3 \
             ORDER BY seq ASC \
             LIMIT ?4",
        )
        .bind(tenant_id.to_string())
        .bind(session_id.to_string())
        .bind(after_seq)
        .bind(limit_i64)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(message_from_row).collect()
    }

    /// Count messages in a session.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn count_messages(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
    ) -> Result<u64, StoreError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT count(*) FROM messages WHERE tenant_id = ?1 AND session_id = ?2",
        )
        .bind(tenant_id.to_string())
        .bind(session_id.to_string())
        .fetch_one(self.pool())
        .await?;
        Ok(row.0.cast_unsigned())
    }
}

fn session_from_row(row: SessionRow) -> Result<Session, StoreError> {
    let (id, tenant_id, user_id, title, status, metadata, created_at, updated_at) = row;
    let metadata: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&metadata)
        .map_err(|e| StoreError::Corrupt(format!("bad session metadata: {e}")))?;
    Ok(Session {
        id: parse_uuid(&id)?,
        tenant_id: parse_uuid(&tenant_id)?,
        user_id: parse_uuid(&user_id)?,
        title,
        status: SessionStatus::parse(&status)?,
        metadata,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn message_from_row(row: MessageRow) -> Result<StoredMessage, StoreError> {
    let (seq, id, session_id, tenant_id, role, content, tool_calls, created_at) = row;
    let tool_calls = tool_calls
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| StoreError::Corrupt(format!("bad tool_calls: {e}")))?;
    Ok(StoredMessage {
        seq,
        message: Message {
            id: parse_uuid(&id)?,
            session_id: parse_uuid(&session_id)?,
            tenant_id: parse_uuid(&tenant_id)?,
            role: MessageRole::parse(&role)?,
            content,
            tool_calls,
            created_at: parse_timestamp(&created_at)?,
        },
    })
}
