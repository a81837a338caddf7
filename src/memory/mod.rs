//! Three-tier memory manager.
//!
//! - *Short-term*: an in-process bounded ring of recent messages per
//!   session. Never persisted.
//! - *Medium-term*: durable per-session notes with a TTL, mirrored into the
//!   session-scoped vector collection.
//! - *Long-term*: durable user-scoped memories deduplicated by content
//!   fingerprint, mirrored into the user-scoped vector collection. Every
//!   row has an embedding with the same id; deletion removes both sides.
//!
//! Queries rank by a hybrid of semantic similarity and keyword overlap.
//! When the vector backend is unavailable the manager degrades to
//! keyword-only ranking and tags the result.

pub mod search;
pub mod vector;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::memories::{LongMemory, MediumNote};
use crate::store::{Store, StoreError};
use crate::types::Message;

use self::vector::{Collection, Embedder, VectorError, VectorStore};

/// Attempts for each side of a cross-store delete before reporting
/// inconsistency.
const DELETE_ATTEMPTS: u32 = 3;

/// Errors from memory operations.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Structured store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Vector backend failure on a write path that must stay consistent.
    #[error(transparent)]
    Vector(#[from] VectorError),

    /// The row/embedding pairing could not be restored after retries.
    #[error("memory stores inconsistent: {0}")]
    Inconsistent(String),
}

/// Which tier and owner a query targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryScope {
    /// Medium-term notes of a session.
    Session {
        /// Owning tenant.
        tenant_id: Uuid,
        /// Session id.
        session_id: Uuid,
    },
    /// Long-term memories of a user.
    User {
        /// Owning tenant.
        tenant_id: Uuid,
        /// User id.
        user_id: Uuid,
    },
}

/// A ranked query hit.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryHit {
    /// Row id.
    pub id: Uuid,
    /// Memory content.
    pub content: String,
    /// Hybrid relevance score.
    pub score: f64,
    /// Importance (long-term only).
    pub importance: Option<f64>,
}

/// Result of a memory query.
#[derive(Debug, Clone, Default)]
pub struct QueryOutcome {
    /// Ranked hits, best first.
    pub hits: Vec<MemoryHit>,
    /// Set when the vector backend was unavailable and ranking fell back
    /// to keywords only.
    pub degraded: bool,
}

/// Counters from a garbage-collection sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Medium-term rows removed.
    pub removed_notes: u64,
    /// Embeddings removed alongside them.
    pub removed_embeddings: u64,
}

/// Central memory manager over the structured store and the vector store.
pub struct MemoryManager {
    store: Arc<Store>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    /// Hybrid ranking weight for the semantic component.
    alpha: f64,
    /// Medium-term TTL.
    ttl: Duration,
    /// Short-term ring capacity.
    short_window: usize,
    /// Per-session short-term rings.
    shorts: Mutex<HashMap<Uuid, VecDeque<Message>>>,
    /// Per-(user, fingerprint) write locks serialising long-term upserts.
    long_locks: Mutex<HashMap<(Uuid, String), Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("alpha", &self.alpha)
            .field("short_window", &self.short_window)
            .finish_non_exhaustive()
    }
}

impl MemoryManager {
    /// Create a manager over the given stores.
    pub fn new(
        store: Arc<Store>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        alpha: f64,
        ttl_days: i64,
        short_window: usize,
    ) -> Self {
        info!(alpha, ttl_days, short_window, "memory manager initialised");
        Self {
            store,
            vectors,
            embedder,
            alpha: alpha.clamp(0.0, 1.0),
            ttl: Duration::days(ttl_days),
            short_window: short_window.max(1),
            shorts: Mutex::new(HashMap::new()),
            long_locks: Mutex::new(HashMap::new()),
        }
    }

    // -- short tier ---------------------------------------------------------

    /// Append a message to the session's short-term ring, evicting the
    /// oldest entry when full.
    pub async fn record_message(&self, session_id: Uuid, message: Message) {
        let mut shorts = self.shorts.lock().await;
        let ring = shorts.entry(session_id).or_default();
        if ring.len() >= self.short_window {
            ring.pop_front();
        }
        ring.push_back(message);
    }

    /// Snapshot of the session's short-term window, oldest first.
    pub async fn short_term(&self, session_id: Uuid) -> Vec<Message> {
        let shorts = self.shorts.lock().await;
        shorts
            .get(&session_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    // -- medium tier --------------------------------------------------------

    /// Durably insert a medium-term note and its embedding.
    ///
    /// The embedding write is best-effort: on vector failure the row is
    /// kept and queries fall back to keyword ranking for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the row insert fails.
    pub async fn note_medium(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        content: &str,
    ) -> Result<MediumNote, MemoryError> {
        let now = Utc::now();
        let note = MediumNote {
            id: Uuid::new_v4(),
            session_id,
            tenant_id,
            content: content.to_owned(),
            created_at: now,
            expires_at: now
                .checked_add_signed(self.ttl)
                .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC),
        };
        self.store.insert_medium_note(&note).await?;

        match self.embedder.embed(content).await {
            Ok(vector) => {
                let collection = Collection::session(tenant_id, session_id);
                if let Err(err) = self.vectors.upsert(collection, note.id, vector).await {
                    warn!(error = %err, note_id = %note.id, "medium note embedding upsert failed");
                }
            }
            Err(err) => {
                warn!(error = %err, note_id = %note.id, "medium note embedding failed");
            }
        }

        Ok(note)
    }

    // -- long tier ----------------------------------------------------------

    /// Upsert a long-term memory by content fingerprint.
    ///
    /// Duplicates merge: source sessions are unioned and the maximum
    /// importance wins, keeping the original row id (and therefore its
    /// embedding). Writes for the same `(user, fingerprint)` are
    /// serialised through a per-key lock.
    ///
    /// # Errors
    ///
    /// Returns an error if either the row or the embedding cannot be
    /// written; a row is never left without its embedding.
    pub async fn add_long(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        content: &str,
        importance: f64,
        source_sessions: &[Uuid],
    ) -> Result<LongMemory, MemoryError> {
        let fingerprint = search::fingerprint(content);
        let key_lock = self.long_lock(user_id, &fingerprint).await;
        let _guard = key_lock.lock().await;

        if let Some(existing) = self
            .store
            .find_long_by_fingerprint(tenant_id, user_id, &fingerprint)
            .await?
        {
            let mut learned_from = existing.learned_from.clone();
            for session in source_sessions {
                if !learned_from.contains(session) {
                    learned_from.push(*session);
                }
            }
            let importance = existing.importance.max(importance.clamp(0.0, 1.0));
            self.store
                .merge_long_memory(existing.id, importance, &learned_from)
                .await?;
            debug!(id = %existing.id, "long-term memory merged");
            return Ok(LongMemory {
                importance,
                learned_from,
                ..existing
            });
        }

        let memory = LongMemory {
            id: Uuid::new_v4(),
            tenant_id,
            user_id,
            fingerprint,
            content: content.to_owned(),
            importance: importance.clamp(0.0, 1.0),
            learned_from: source_sessions.to_vec(),
            created_at: Utc::now(),
        };

        // Embedding first: a row must never exist without its pair.
        let vector = self.embedder.embed(content).await?;
        let collection = Collection::user(tenant_id, user_id);
        self.vectors.upsert(collection, memory.id, vector).await?;

        if let Err(err) = self.store.insert_long_memory(&memory).await {
            // Roll the embedding back so the pairing stays clean.
            if let Err(cleanup) = self.vectors.delete(collection, &[memory.id]).await {
                warn!(error = %cleanup, id = %memory.id, "orphan embedding cleanup failed");
            }
            return Err(err.into());
        }

        debug!(id = %memory.id, "long-term memory added");
        Ok(memory)
    }

    /// Delete long-term memories, removing rows and embeddings together.
    ///
    /// Each side is retried up to [`DELETE_ATTEMPTS`] times; if the
    /// embedding side still fails the operation reports
    /// [`MemoryError::Inconsistent`].
    ///
    /// # Errors
    ///
    /// Returns an error on store failure or persistent inconsistency.
    pub async fn delete_long(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        ids: &[Uuid],
    ) -> Result<u64, MemoryError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let removed = self.store.delete_long_memories(ids).await?;

        let collection = Collection::user(tenant_id, user_id);
        let mut last_error: Option<VectorError> = None;
        for attempt in 1..=DELETE_ATTEMPTS {
            match self.vectors.delete(collection, ids).await {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(err) => {
                    warn!(attempt, error = %err, "embedding delete failed");
                    last_error = Some(err);
                }
            }
        }

        if let Some(err) = last_error {
            return Err(MemoryError::Inconsistent(format!(
                "rows deleted but embeddings remain: {err}"
            )));
        }
        Ok(removed)
    }

    // -- query --------------------------------------------------------------

    /// Query a memory scope, ranking by hybrid score.
    ///
    /// Empty queries return no hits. A degraded vector backend yields
    /// keyword-only ranking with `degraded = true`.
    ///
    /// # Errors
    ///
    /// Returns an error on structured-store failure.
    pub async fn query(
        &self,
        scope: MemoryScope,
        query_text: &str,
        k: usize,
        min_importance: Option<f64>,
    ) -> Result<QueryOutcome, MemoryError> {
        if query_text.trim().is_empty() || k == 0 {
            return Ok(QueryOutcome::default());
        }

        // Candidate rows from the structured store.
        let candidates: Vec<(Uuid, String, Option<f64>)> = match scope {
            MemoryScope::Session {
                tenant_id,
                session_id,
            } => self
                .store
                .list_medium_notes(tenant_id, session_id, Utc::now())
                .await?
                .into_iter()
                .map(|n| (n.id, n.content, None))
                .collect(),
            MemoryScope::User { tenant_id, user_id } => self
                .store
                .list_long_memories(tenant_id, user_id, min_importance.unwrap_or(0.0))
                .await?
                .into_iter()
                .map(|m| (m.id, m.content, Some(m.importance)))
                .collect(),
        };

        if candidates.is_empty() {
            return Ok(QueryOutcome::default());
        }

        // Semantic side; any failure flips the outcome to degraded.
        let collection = match scope {
            MemoryScope::Session {
                tenant_id,
                session_id,
            } => Collection::session(tenant_id, session_id),
            MemoryScope::User { tenant_id, user_id } => Collection::user(tenant_id, user_id),
        };

        let mut degraded = false;
        let mut semantic: HashMap<Uuid, f64> = HashMap::new();
        match self.embedder.embed(query_text).await {
            Ok(query_vector) => {
                match self
                    .vectors
                    .query(collection, &query_vector, k.saturating_mul(4))
                    .await
                {
                    Ok(matches) => {
                        for m in matches {
                            semantic.insert(m.id, m.score.max(0.0));
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "vector query failed; keyword-only ranking");
                        degraded = true;
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "query embedding failed; keyword-only ranking");
                degraded = true;
            }
        }

        let mut hits: Vec<MemoryHit> = candidates
            .into_iter()
            .map(|(id, content, importance)| {
                let keyword = search::keyword_jaccard(query_text, &content);
                let score = if degraded {
                    keyword
                } else {
                    let sem = semantic.get(&id).copied().unwrap_or(0.0);
                    search::hybrid_score(sem, keyword, self.alpha)
                };
                MemoryHit {
                    id,
                    content,
                    score,
                    importance,
                }
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);

        Ok(QueryOutcome { hits, degraded })
    }

    // -- maintenance --------------------------------------------------------

    /// Remove expired medium-term notes and their embeddings.
    ///
    /// # Errors
    ///
    /// Returns an error on structured-store failure; vector deletions are
    /// best-effort per collection.
    pub async fn gc(&self) -> Result<GcStats, MemoryError> {
        let now = Utc::now();
        let expired = self.store.list_expired_medium_notes(now).await?;

        // Group by owning collection so one degraded collection does not
        // block the rest.
        let mut by_collection: HashMap<(Uuid, Uuid), Vec<Uuid>> = HashMap::new();
        for note in &expired {
            by_collection
                .entry((note.tenant_id, note.session_id))
                .or_default()
                .push(note.id);
        }

        let mut removed_embeddings = 0u64;
        for ((tenant_id, session_id), ids) in by_collection {
            let collection = Collection::session(tenant_id, session_id);
            match self.vectors.delete(collection, &ids).await {
                Ok(()) => {
                    removed_embeddings =
                        removed_embeddings.saturating_add(ids.len().try_into().unwrap_or(u64::MAX));
                }
                Err(err) => {
                    warn!(error = %err, session = %session_id, "embedding gc failed");
                }
            }
        }

        let removed_notes = self.store.delete_expired_medium_notes(now).await?;
        if removed_notes > 0 {
            info!(removed_notes, removed_embeddings, "memory gc completed");
        }
        Ok(GcStats {
            removed_notes,
            removed_embeddings,
        })
    }

    /// Whether an embedding exists for a long-term row (used by invariant
    /// checks in tests and the health probe).
    ///
    /// # Errors
    ///
    /// Returns an error if the vector backend is unreachable.
    pub async fn has_embedding(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        id: Uuid,
    ) -> Result<bool, MemoryError> {
        Ok(self
            .vectors
            .contains(Collection::user(tenant_id, user_id), id)
            .await?)
    }

    async fn long_lock(&self, user_id: Uuid, fingerprint: &str) -> Arc<Mutex<()>> {
        let mut locks = self.long_locks.lock().await;
        locks
            .entry((user_id, fingerprint.to_owned()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::vector::{HashEmbedder, InMemoryVectorStore};
    use super::*;
    use crate::types::MessageRole;

    fn manager_with(
        store: Arc<Store>,
        vectors: Arc<InMemoryVectorStore>,
    ) -> MemoryManager {
        MemoryManager::new(
            store,
            vectors,
            Arc::new(HashEmbedder::default()),
            0.7,
            30,
            3,
        )
    }

    async fn setup() -> (MemoryManager, Arc<InMemoryVectorStore>) {
        let store = Arc::new(Store::open_in_memory().await.expect("open"));
        let vectors = Arc::new(InMemoryVectorStore::new());
        (manager_with(store, vectors.clone()), vectors)
    }

    #[tokio::test]
    async fn test_short_term_ring_evicts_oldest() {
        let (manager, _) = setup().await;
        let session_id = Uuid::new_v4();
        let tenant_id = Uuid::new_v4();

        for i in 0..5 {
            manager
                .record_message(
                    session_id,
                    Message::new(session_id, tenant_id, MessageRole::User, &format!("m{i}")),
                )
                .await;
        }

        let window = manager.short_term(session_id).await;
        assert_eq!(window.len(), 3, "ring capacity is 3");
        assert_eq!(window[0].content, "m2", "oldest entries evicted");
        assert_eq!(window[2].content, "m4");
    }

    #[tokio::test]
    async fn test_add_long_creates_row_and_embedding() {
        let (manager, _) = setup().await;
        let tenant_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let session = Uuid::new_v4();

        let memory = manager
            .add_long(tenant_id, user_id, "Prefers espresso over filter coffee", 0.8, &[session])
            .await
            .expect("add");

        assert!(manager
            .has_embedding(tenant_id, user_id, memory.id)
            .await
            .expect("check"));
    }

    #[tokio::test]
    async fn test_add_long_duplicate_merges() {
        let (manager, _) = setup().await;
        let tenant_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();

        let first = manager
            .add_long(tenant_id, user_id, "Works at ACME Corp", 0.5, &[s1])
            .await
            .expect("first");

        // Same content modulo case/whitespace dedupes onto the same row.
        let second = manager
            .add_long(tenant_id, user_id, "works at  acme corp", 0.9, &[s1, s2])
            .await
            .expect("second");

        assert_eq!(second.id, first.id);
        assert!((second.importance - 0.9).abs() < f64::EPSILON, "max importance wins");
        assert_eq!(second.learned_from, vec![s1, s2], "sources unioned");
    }

    #[tokio::test]
    async fn test_delete_long_removes_both_sides() {
        let (manager, vectors) = setup().await;
        let tenant_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        let memory = manager
            .add_long(tenant_id, user_id, "Lives in Milan", 0.7, &[])
            .await
            .expect("add");

        let removed = manager
            .delete_long(tenant_id, user_id, &[memory.id])
            .await
            .expect("delete");
        assert_eq!(removed, 1);
        assert!(!vectors
            .contains(Collection::user(tenant_id, user_id), memory.id)
            .await
            .expect("contains"));
    }

    #[tokio::test]
    async fn test_delete_long_reports_inconsistency() {
        let (manager, vectors) = setup().await;
        let tenant_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        let memory = manager
            .add_long(tenant_id, user_id, "Allergic to peanuts", 0.9, &[])
            .await
            .expect("add");

        vectors.set_degraded(true);
        let result = manager.delete_long(tenant_id, user_id, &[memory.id]).await;
        assert!(
            matches!(result, Err(MemoryError::Inconsistent(_))),
            "persistent vector failure surfaces as inconsistency"
        );
    }

    #[tokio::test]
    async fn test_query_empty_text_returns_nothing() {
        let (manager, _) = setup().await;
        let scope = MemoryScope::User {
            tenant_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
        };
        let outcome = manager.query(scope, "   ", 5, None).await.expect("query");
        assert!(outcome.hits.is_empty());
        assert!(!outcome.degraded);
    }

    #[tokio::test]
    async fn test_query_ranks_relevant_first() {
        let (manager, _) = setup().await;
        let tenant_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        manager
            .add_long(tenant_id, user_id, "Favourite editor is Helix", 0.6, &[])
            .await
            .expect("add");
        manager
            .add_long(tenant_id, user_id, "Team standup is at 9am daily", 0.6, &[])
            .await
            .expect("add");

        let scope = MemoryScope::User { tenant_id, user_id };
        let outcome = manager
            .query(scope, "what editor does the user like", 1, None)
            .await
            .expect("query");
        assert_eq!(outcome.hits.len(), 1);
        assert!(outcome.hits[0].content.contains("Helix"));
        assert!(!outcome.degraded);
    }

    #[tokio::test]
    async fn test_query_degrades_to_keyword_ranking() {
        let (manager, vectors) = setup().await;
        let tenant_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        manager
            .add_long(tenant_id, user_id, "Favourite editor is Helix", 0.6, &[])
            .await
            .expect("add");

        vectors.set_degraded(true);
        let scope = MemoryScope::User { tenant_id, user_id };
        let outcome = manager
            .query(scope, "favourite editor", 5, None)
            .await
            .expect("query");
        assert!(outcome.degraded);
        assert_eq!(outcome.hits.len(), 1);
        assert!(outcome.hits[0].score > 0.0);
    }

    #[tokio::test]
    async fn test_query_min_importance_filter() {
        let (manager, _) = setup().await;
        let tenant_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        manager
            .add_long(tenant_id, user_id, "Casual remark about weather", 0.2, &[])
            .await
            .expect("add");
        manager
            .add_long(tenant_id, user_id, "Birthday is July 12 1990", 0.95, &[])
            .await
            .expect("add");

        let scope = MemoryScope::User { tenant_id, user_id };
        let outcome = manager
            .query(scope, "birthday weather remark", 10, Some(0.7))
            .await
            .expect("query");
        assert_eq!(outcome.hits.len(), 1);
        assert!(outcome.hits[0].content.contains("Birthday"));
    }

    #[tokio::test]
    async fn test_gc_removes_expired_notes_and_embeddings() {
        let store = Arc::new(Store::open_in_memory().await.expect("open"));
        let vectors = Arc::new(InMemoryVectorStore::new());
        // Negative TTL: every note is born expired.
        let manager = MemoryManager::new(
            store.clone(),
            vectors.clone(),
            Arc::new(HashEmbedder::default()),
            0.7,
            -1,
            3,
        );

        let tenant_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        let note = manager
            .note_medium(tenant_id, session_id, "temporary context")
            .await
            .expect("note");

        let stats = manager.gc().await.expect("gc");
        assert_eq!(stats.removed_notes, 1);
        assert_eq!(stats.removed_embeddings, 1);
        assert!(!vectors
            .contains(Collection::session(tenant_id, session_id), note.id)
            .await
            .expect("contains"));
    }
}
