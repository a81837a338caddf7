//! Per-session runtime state.
//!
//! Each session gets a registry entry holding its request lock (at most
//! one request per session is processed at a time) and its message cursor
//! for incremental history reads. Durable session state (status, metadata,
//! the pending plan) lives in the structured store; this module only holds
//! what must be coordinated in-process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

/// In-process coordination state for one session.
#[derive(Debug)]
pub struct SessionEntry {
    /// Serialises requests on the session.
    request_lock: Mutex<()>,
    /// Highest message sequence already consumed by context loading.
    cursor: AtomicI64,
}

impl SessionEntry {
    fn new() -> Self {
        Self {
            request_lock: Mutex::new(()),
            cursor: AtomicI64::new(0),
        }
    }

    /// Acquire the session's request lock. Held for the duration of a
    /// request's critical path.
    pub async fn lock_request(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.request_lock.lock().await
    }

    /// The message cursor: the last sequence number loaded into context.
    pub fn cursor(&self) -> i64 {
        self.cursor.load(Ordering::Acquire)
    }

    /// Advance the cursor monotonically.
    pub fn advance_cursor(&self, seq: i64) {
        self.cursor.fetch_max(seq, Ordering::AcqRel);
    }
}

/// Registry of live session entries.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    entries: Mutex<HashMap<Uuid, Arc<SessionEntry>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the entry for a session.
    pub async fn entry(&self, session_id: Uuid) -> Arc<SessionEntry> {
        let mut entries = self.entries.lock().await;
        entries
            .entry(session_id)
            .or_insert_with(|| Arc::new(SessionEntry::new()))
            .clone()
    }

    /// Number of sessions with live state.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether no sessions have live state.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Drop the entry of an archived session.
    pub async fn evict(&self, session_id: Uuid) {
        self.entries.lock().await.remove(&session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_entry_is_shared_per_session() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();

        let a = registry.entry(id).await;
        let b = registry.entry(id).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_cursor_is_monotonic() {
        let registry = SessionRegistry::new();
        let entry = registry.entry(Uuid::new_v4()).await;

        entry.advance_cursor(5);
        entry.advance_cursor(3);
        assert_eq!(entry.cursor(), 5, "cursor never moves backwards");
        entry.advance_cursor(9);
        assert_eq!(entry.cursor(), 9);
    }

    #[tokio::test]
    async fn test_request_lock_serialises() {
        let registry = Arc::new(SessionRegistry::new());
        let id = Uuid::new_v4();
        let entry = registry.entry(id).await;

        let guard = entry.lock_request().await;

        let entry2 = registry.entry(id).await;
        let second = tokio::spawn(async move {
            let _guard = entry2.lock_request().await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished(), "second request waits for the first");

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .expect("second request proceeds")
            .expect("join");
    }
}
