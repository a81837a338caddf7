//! Medium- and long-term memory rows.
//!
//! Row-level persistence only. Fingerprinting, embedding synchronisation,
//! ranking and the per-key write locks live in [`crate::memory`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::writer::WriteOp;
use super::{parse_timestamp, parse_uuid, Store, StoreError};

/// A durable per-session note with a TTL. Paired with an embedding of the
/// same id in the session-scoped vector collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediumNote {
    /// Note id, shared with its embedding.
    pub id: Uuid,
    /// Owning session.
    pub session_id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Note content.
    pub content: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Expiry timestamp.
    pub expires_at: DateTime<Utc>,
}

/// A durable user-scoped memory. Paired with an embedding of the same id in
/// the user-scoped vector collection; at most one row per
/// `(user_id, fingerprint)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongMemory {
    /// Row id, shared with its embedding.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// Normalised content fingerprint.
    pub fingerprint: String,
    /// Content text.
    pub content: String,
    /// Importance in [0, 1].
    pub importance: f64,
    /// Sessions the memory was learned from.
    pub learned_from: Vec<Uuid>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

type MediumRow = (String, String, String, String, String, String);
type LongRow = (String, String, String, String, String, f64, String, String);

impl Store {
    // -- medium tier --------------------------------------------------------

    /// Insert a medium-term note row.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn insert_medium_note(&self, note: &MediumNote) -> Result<(), StoreError> {
        self.execute(WriteOp::InsertMediumNote {
            id: note.id,
            session_id: note.session_id,
            tenant_id: note.tenant_id,
            content: note.content.clone(),
            created_at: note.created_at,
            expires_at: note.expires_at,
        })
        .await?;
        Ok(())
    }

    /// List non-expired notes of a session, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or corrupt rows.
    pub async fn list_medium_notes(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<MediumNote>, StoreError> {
        let rows: Vec<MediumRow> = sqlx::query_as(
            "SELECT id, session_id, tenant_id, content, created_at, expires_at \
             FROM memories_medium \
             WHERE tenant_id = ?1 AND session_id = ?2 AND expires_at > ?3 \
             ORDER BY created_at DESC",
        )
        .bind(tenant_id.to_string())
        .bind(session_id.to_string())
        .bind(now.to_rfc3339())
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(medium_from_row).collect()
    }

    /// List notes past their expiry (for garbage collection).
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or corrupt rows.
    pub async fn list_expired_medium_notes(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<MediumNote>, StoreError> {
        let rows: Vec<MediumRow> = sqlx::query_as(
            "SELECT id, session_id, tenant_id, content, created_at, expires_at \
             FROM memories_medium WHERE expires_at <= ?1",
        )
        .bind(now.to_rfc3339())
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(medium_from_row).collect()
    }

    /// Delete notes past their expiry; returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete_expired_medium_notes(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.execute(WriteOp::DeleteExpiredMediumNotes { now }).await
    }

    // -- long tier ----------------------------------------------------------

    /// Insert a long-term memory row.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails (including a duplicate
    /// `(user_id, fingerprint)` pair).
    pub async fn insert_long_memory(&self, memory: &LongMemory) -> Result<(), StoreError> {
        let learned_from_json = serde_json::to_string(&memory.learned_from)
            .map_err(|e| StoreError::Corrupt(format!("bad learned_from: {e}")))?;
        self.execute(WriteOp::InsertLongMemory {
            id: memory.id,
            tenant_id: memory.tenant_id,
            user_id: memory.user_id,
            fingerprint: memory.fingerprint.clone(),
            content: memory.content.clone(),
            importance: memory.importance,
            learned_from_json,
            created_at: memory.created_at,
        })
        .await?;
        Ok(())
    }

    /// Merge importance and sources into an existing long-term row.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn merge_long_memory(
        &self,
        id: Uuid,
        importance: f64,
        learned_from: &[Uuid],
    ) -> Result<(), StoreError> {
        let learned_from_json = serde_json::to_string(learned_from)
            .map_err(|e| StoreError::Corrupt(format!("bad learned_from: {e}")))?;
        self.execute(WriteOp::MergeLongMemory {
            id,
            importance,
            learned_from_json,
        })
        .await?;
        Ok(())
    }

    /// Fetch the long-term row for a `(user, fingerprint)` pair, if any.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or corrupt rows.
    pub async fn find_long_by_fingerprint(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<LongMemory>, StoreError> {
        let row: Option<LongRow> = sqlx::query_as(
            "SELECT id, tenant_id, user_id, fingerprint, content, importance, learned_from, created_at \
             FROM memories_long \
             WHERE tenant_id = ?1 AND user_id = ?2 AND fingerprint = ?3",
        )
        .bind(tenant_id.to_string())
        .bind(user_id.to_string())
        .bind(fingerprint)
        .fetch_optional(self.pool())
        .await?;

        row.map(long_from_row).transpose()
    }

    /// Fetch long-term rows by id within a tenant.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or corrupt rows.
    pub async fn get_long_memories(
        &self,
        tenant_id: Uuid,
        ids: &[Uuid],
    ) -> Result<Vec<LongMemory>, StoreError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let row: Option<LongRow> = sqlx::query_as(
                "SELECT id, tenant_id, user_id, fingerprint, content, importance, learned_from, created_at \
                 FROM memories_long WHERE tenant_id = ?1 AND id = ?2",
            )
            .bind(tenant_id.to_string())
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;
            if let Some(row) = row {
                out.push(long_from_row(row)?);
            }
        }
        Ok(out)
    }

    /// List a user's long-term memories above an importance floor.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or corrupt rows.
    pub async fn list_long_memories(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        min_importance: f64,
    ) -> Result<Vec<LongMemory>, StoreError> {
        let rows: Vec<LongRow> = sqlx::query_as(
            "SELECT id, tenant_id, user_id, fingerprint, content, importance, learned_from, created_at \
             FROM memories_long \
             WHERE tenant_id = ?1 AND user_id = ?2 AND importance >= ?3 \
             ORDER BY importance DESC",
        )
        .bind(tenant_id.to_string())
        .bind(user_id.to_string())
        .bind(min_importance)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(long_from_row).collect()
    }

    /// Delete long-term rows by id; returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete_long_memories(&self, ids: &[Uuid]) -> Result<u64, StoreError> {
        self.execute(WriteOp::DeleteLongMemories { ids: ids.to_vec() })
            .await
    }
}

fn medium_from_row(row: MediumRow) -> Result<MediumNote, StoreError> {
    let (id, session_id, tenant_id, content, created_at, expires_at) = row;
    Ok(MediumNote {
        id: parse_uuid(&id)?,
        session_id: parse_uuid(&session_id)?,
        tenant_id: parse_uuid(&tenant_id)?,
        content,
        created_at: parse_timestamp(&created_at)?,
        expires_at: parse_timestamp(&expires_at)?,
    })
}

fn long_from_row(row: LongRow) -> Result<LongMemory, StoreError> {
    let (id, tenant_id, user_id, fingerprint, content, importance, learned_from, created_at) = row;
    let learned_from: Vec<Uuid> = serde_json::from_str(&learned_from)
        .map_err(|e| StoreError::Corrupt(format!("bad learned_from: {e}")))?;
    Ok(LongMemory {
        id: parse_uuid(&id)?,
        tenant_id: parse_uuid(&tenant_id)?,
        user_id: parse_uuid(&user_id)?,
        fingerprint,
        content,
        importance,
        learned_from,
        created_at: parse_timestamp(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn note(session_id: Uuid, tenant_id: Uuid, content: &str, ttl: Duration) -> MediumNote {
        let now = Utc::now();
        MediumNote {
            id: Uuid::new_v4(),
            session_id,
            tenant_id,
            content: content.to_owned(),
            created_at: now,
            expires_at: now
                .checked_add_signed(ttl)
                .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC),
        }
    }

    #[tokio::test]
    async fn test_medium_note_ttl_visibility() {
        let store = Store::open_in_memory().await.expect("open");
        let tenant_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();

        let fresh = note(session_id, tenant_id, "fresh", Duration::days(30));
        let stale = note(session_id, tenant_id, "stale", Duration::seconds(-5));
        store.insert_medium_note(&fresh).await.expect("insert");
        store.insert_medium_note(&stale).await.expect("insert");

        let visible = store
            .list_medium_notes(tenant_id, session_id, Utc::now())
            .await
            .expect("list");
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].content, "fresh");

        let expired = store
            .list_expired_medium_notes(Utc::now())
            .await
            .expect("expired");
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].content, "stale");

        let removed = store
            .delete_expired_medium_notes(Utc::now())
            .await
            .expect("gc");
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn test_long_memory_fingerprint_unique() {
        let store = Store::open_in_memory().await.expect("open");
        let tenant_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        let mem = LongMemory {
            id: Uuid::new_v4(),
            tenant_id,
            user_id,
            fingerprint: "abc123".to_owned(),
            content: "Prefers dark mode".to_owned(),
            importance: 0.8,
            learned_from: vec![Uuid::new_v4()],
            created_at: Utc::now(),
        };
        store.insert_long_memory(&mem).await.expect("insert");

        // Second row with the same (user, fingerprint) is rejected.
        let dup = LongMemory {
            id: Uuid::new_v4(),
            ..mem.clone()
        };
        assert!(store.insert_long_memory(&dup).await.is_err());

        // Same fingerprint for a different user is fine.
        let other_user = LongMemory {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            ..mem.clone()
        };
        store.insert_long_memory(&other_user).await.expect("insert");
    }

    #[tokio::test]
    async fn test_long_memory_merge_and_delete() {
        let store = Store::open_in_memory().await.expect("open");
        let tenant_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();

        let mem = LongMemory {
            id: Uuid::new_v4(),
            tenant_id,
            user_id,
            fingerprint: "fp".to_owned(),
            content: "Works at ACME".to_owned(),
            importance: 0.5,
            learned_from: vec![s1],
            created_at: Utc::now(),
        };
        store.insert_long_memory(&mem).await.expect("insert");

        store
            .merge_long_memory(mem.id, 0.9, &[s1, s2])
            .await
            .expect("merge");

        let loaded = store
            .find_long_by_fingerprint(tenant_id, user_id, "fp")
            .await
            .expect("find")
            .expect("present");
        assert_eq!(loaded.id, mem.id, "merge keeps the original id");
        assert!((loaded.importance - 0.9).abs() < f64::EPSILON);
        assert_eq!(loaded.learned_from, vec![s1, s2]);

        let removed = store.delete_long_memories(&[mem.id]).await.expect("delete");
        assert_eq!(removed, 1);
        assert!(store
            .find_long_by_fingerprint(tenant_id, user_id, "fp")
            .await
            .expect("find")
            .is_none());
    }
}
