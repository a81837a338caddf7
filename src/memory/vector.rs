//! Vector store and embedder collaborator interfaces.
//!
//! Collections are namespaced by `{tenant, scope}` so session- and
//! user-scoped embeddings never mix. The in-memory implementation backs
//! tests and single-node deployments; production swaps in a remote store
//! behind the same trait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

/// Errors from the vector store or embedder.
#[derive(Debug, thiserror::Error)]
pub enum VectorError {
    /// HTTP transport failure.
    #[error("vector request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Response did not match the expected format.
    #[error("vector response parse error: {0}")]
    Parse(String),

    /// The store or embedding provider is unavailable.
    #[error("vector backend unavailable: {0}")]
    Unavailable(String),
}

/// Embedding generation interface.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate an embedding vector for the given text.
    ///
    /// # Errors
    ///
    /// Returns an error if the embedding provider is unreachable or the
    /// request fails.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, VectorError>;

    /// Dimensionality of the vectors produced.
    fn dimensions(&self) -> usize;
}

/// Scope of a vector collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionScope {
    /// Session-scoped (medium-term notes).
    Session(Uuid),
    /// User-scoped (long-term memories).
    User(Uuid),
}

/// A namespaced collection key: `{tenant, scope}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Collection {
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Session or user scope.
    pub scope: CollectionScope,
}

impl Collection {
    /// Session-scoped collection.
    pub fn session(tenant_id: Uuid, session_id: Uuid) -> Self {
        Self {
            tenant_id,
            scope: CollectionScope::Session(session_id),
        }
    }

    /// User-scoped collection.
    pub fn user(tenant_id: Uuid, user_id: Uuid) -> Self {
        Self {
            tenant_id,
            scope: CollectionScope::User(user_id),
        }
    }

    /// Stable string name for remote stores.
    pub fn name(&self) -> String {
        match self.scope {
            CollectionScope::Session(id) => format!("{}:session:{id}", self.tenant_id),
            CollectionScope::User(id) => format!("{}:user:{id}", self.tenant_id),
        }
    }
}

/// A similarity match returned by [`VectorStore::query`].
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    /// Record id (shared with the paired store row).
    pub id: Uuid,
    /// Cosine similarity in [-1, 1].
    pub score: f64,
}

/// Vector store collaborator interface.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace an embedding.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    async fn upsert(
        &self,
        collection: Collection,
        id: Uuid,
        vector: Vec<f32>,
    ) -> Result<(), VectorError>;

    /// Return up to `k` nearest records by cosine similarity.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    async fn query(
        &self,
        collection: Collection,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<VectorMatch>, VectorError>;

    /// Delete embeddings by id. Missing ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    async fn delete(&self, collection: Collection, ids: &[Uuid]) -> Result<(), VectorError>;

    /// Whether an embedding with this id exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    async fn contains(&self, collection: Collection, id: Uuid) -> Result<bool, VectorError>;
}

/// Cosine similarity between two vectors of equal length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

/// Deterministic token-hash embedder.
///
/// Buckets lower-cased tokens into a fixed-width histogram. No model is
/// required, embeddings are stable across runs, and texts sharing tokens
/// land near each other — a lexical baseline used when no remote embedding
/// provider is configured, and by tests.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    /// Create an embedder with the given vector width.
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, VectorError> {
        use std::hash::{Hash, Hasher};

        let mut vector = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            token.to_lowercase().hash(&mut hasher);
            let dims = u64::try_from(self.dims).unwrap_or(1).max(1);
            let bucket = usize::try_from(hasher.finish() % dims).unwrap_or(0);
            if let Some(slot) = vector.get_mut(bucket) {
                *slot += 1.0;
            }
        }
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// In-process vector store used by tests and single-node deployments.
///
/// `set_degraded(true)` makes every call fail, exercising the keyword-only
/// fallback path of the memory manager.
#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<Collection, HashMap<Uuid, Vec<f32>>>>,
    degraded: AtomicBool,
}

impl InMemoryVectorStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated unavailability.
    pub fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), VectorError> {
        if self.degraded.load(Ordering::SeqCst) {
            Err(VectorError::Unavailable("degraded".to_owned()))
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for InMemoryVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.collections.read().map(|c| c.len()).unwrap_or(0);
        f.debug_struct("InMemoryVectorStore")
            .field("collections", &count)
            .finish()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(
        &self,
        collection: Collection,
        id: Uuid,
        vector: Vec<f32>,
    ) -> Result<(), VectorError> {
        self.check_available()?;
        let mut collections = self
            .collections
            .write()
            .map_err(|_| VectorError::Unavailable("lock poisoned".to_owned()))?;
        collections.entry(collection).or_default().insert(id, vector);
        Ok(())
    }

    async fn query(
        &self,
        collection: Collection,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<VectorMatch>, VectorError> {
        self.check_available()?;
        let collections = self
            .collections
            .read()
            .map_err(|_| VectorError::Unavailable("lock poisoned".to_owned()))?;

        let mut matches: Vec<VectorMatch> = collections
            .get(&collection)
            .map(|records| {
                records
                    .iter()
                    .map(|(id, v)| VectorMatch {
                        id: *id,
                        score: cosine_similarity(vector, v),
                    })
                    .collect()
            })
            .unwrap_or_default();

        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(k);
        Ok(matches)
    }

    async fn delete(&self, collection: Collection, ids: &[Uuid]) -> Result<(), VectorError> {
        self.check_available()?;
        let mut collections = self
            .collections
            .write()
            .map_err(|_| VectorError::Unavailable("lock poisoned".to_owned()))?;
        if let Some(records) = collections.get_mut(&collection) {
            for id in ids {
                records.remove(id);
            }
        }
        Ok(())
    }

    async fn contains(&self, collection: Collection, id: Uuid) -> Result<bool, VectorError> {
        self.check_available()?;
        let collections = self
            .collections
            .read()
            .map_err(|_| VectorError::Unavailable("lock poisoned".to_owned()))?;
        Ok(collections
            .get(&collection)
            .is_some_and(|records| records.contains_key(&id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-9);
        // Mismatched or empty vectors score zero instead of panicking.
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[tokio::test]
    async fn test_upsert_query_delete_roundtrip() {
        let store = InMemoryVectorStore::new();
        let collection = Collection::user(Uuid::new_v4(), Uuid::new_v4());

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store
            .upsert(collection, a, vec![1.0, 0.0])
            .await
            .expect("upsert a");
        store
            .upsert(collection, b, vec![0.0, 1.0])
            .await
            .expect("upsert b");

        let matches = store
            .query(collection, &[1.0, 0.1], 10)
            .await
            .expect("query");
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].id, a, "closest vector ranks first");

        store.delete(collection, &[a]).await.expect("delete");
        assert!(!store.contains(collection, a).await.expect("contains"));
        assert!(store.contains(collection, b).await.expect("contains"));
    }

    #[tokio::test]
    async fn test_collections_are_isolated() {
        let store = InMemoryVectorStore::new();
        let tenant = Uuid::new_v4();
        let c1 = Collection::session(tenant, Uuid::new_v4());
        let c2 = Collection::session(tenant, Uuid::new_v4());

        let id = Uuid::new_v4();
        store.upsert(c1, id, vec![1.0]).await.expect("upsert");

        assert!(store.contains(c1, id).await.expect("c1"));
        assert!(!store.contains(c2, id).await.expect("c2"));
        assert!(store.query(c2, &[1.0], 5).await.expect("query").is_empty());
    }

    #[tokio::test]
    async fn test_degraded_mode_fails_all_calls() {
        let store = InMemoryVectorStore::new();
        store.set_degraded(true);
        let collection = Collection::user(Uuid::new_v4(), Uuid::new_v4());
        assert!(store
            .upsert(collection, Uuid::new_v4(), vec![1.0])
            .await
            .is_err());
        assert!(store.query(collection, &[1.0], 1).await.is_err());
    }
}
