//! Cross-store invariants of the memory tiers.

use std::sync::Arc;

use uuid::Uuid;

use armitage::memory::vector::{Collection, HashEmbedder, InMemoryVectorStore, VectorStore};
use armitage::memory::{MemoryManager, MemoryScope};
use armitage::store::Store;

async fn setup() -> (MemoryManager, Arc<Store>, Arc<InMemoryVectorStore>) {
    let store = Arc::new(Store::open_in_memory().await.expect("open"));
    let vectors = Arc::new(InMemoryVectorStore::new());
    let manager = MemoryManager::new(
        store.clone(),
        vectors.clone(),
        Arc::new(HashEmbedder::default()),
        0.7,
        30,
        20,
    );
    (manager, store, vectors)
}

#[tokio::test]
async fn test_row_embedding_bijection_held_through_lifecycle() {
    let (manager, store, vectors) = setup().await;
    let tenant_id = Uuid::new_v4();
    let user_id = Uuid::new_v4();
    let collection = Collection::user(tenant_id, user_id);

    // Every insert pairs a row with an embedding of the same id.
    let mut ids = Vec::new();
    for content in [
        "Works remotely from Lisbon",
        "Prefers tea over coffee",
        "Team demo every Friday",
    ] {
        let memory = manager
            .add_long(tenant_id, user_id, content, 0.8, &[])
            .await
            .expect("add");
        ids.push(memory.id);
    }
    for id in &ids {
        assert!(vectors.contains(collection, *id).await.expect("contains"));
    }

    // Merging a duplicate creates no second row or embedding.
    let merged = manager
        .add_long(tenant_id, user_id, "prefers TEA over coffee", 0.9, &[])
        .await
        .expect("merge");
    assert!(ids.contains(&merged.id));
    let rows = store
        .list_long_memories(tenant_id, user_id, 0.0)
        .await
        .expect("rows");
    assert_eq!(rows.len(), 3);

    // Deletion removes both sides.
    let removed = manager
        .delete_long(tenant_id, user_id, &ids)
        .await
        .expect("delete");
    assert_eq!(removed, 3);
    for id in &ids {
        assert!(!vectors.contains(collection, *id).await.expect("contains"));
    }
    assert!(store
        .list_long_memories(tenant_id, user_id, 0.0)
        .await
        .expect("rows")
        .is_empty());
}

#[tokio::test]
async fn test_fingerprint_dedupe_is_per_user() {
    let (manager, store, _) = setup().await;
    let tenant_id = Uuid::new_v4();
    let user_a = Uuid::new_v4();
    let user_b = Uuid::new_v4();

    manager
        .add_long(tenant_id, user_a, "Speaks fluent Italian", 0.7, &[])
        .await
        .expect("a");
    manager
        .add_long(tenant_id, user_a, "speaks  fluent italian", 0.8, &[])
        .await
        .expect("a dup");
    manager
        .add_long(tenant_id, user_b, "Speaks fluent Italian", 0.7, &[])
        .await
        .expect("b");

    assert_eq!(
        store
            .list_long_memories(tenant_id, user_a, 0.0)
            .await
            .expect("a rows")
            .len(),
        1,
        "duplicates merged for the same user"
    );
    assert_eq!(
        store
            .list_long_memories(tenant_id, user_b, 0.0)
            .await
            .expect("b rows")
            .len(),
        1,
        "other users keep their own copy"
    );
}

#[tokio::test]
async fn test_concurrent_duplicate_adds_converge_to_one_row() {
    let (manager, store, _) = setup().await;
    let manager = Arc::new(manager);
    let tenant_id = Uuid::new_v4();
    let user_id = Uuid::new_v4();

    let mut handles = Vec::new();
    for i in 0..8 {
        let manager = manager.clone();
        let session = Uuid::new_v4();
        handles.push(tokio::spawn(async move {
            manager
                .add_long(
                    tenant_id,
                    user_id,
                    "Deploy window is Tuesday evening",
                    0.1 * f64::from(i),
                    &[session],
                )
                .await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("add");
    }

    let rows = store
        .list_long_memories(tenant_id, user_id, 0.0)
        .await
        .expect("rows");
    assert_eq!(rows.len(), 1, "per-key locks serialise duplicate writers");
    assert_eq!(rows[0].learned_from.len(), 8, "all sources merged");
}

#[tokio::test]
async fn test_degraded_store_still_answers_queries() {
    let (manager, _, vectors) = setup().await;
    let tenant_id = Uuid::new_v4();
    let user_id = Uuid::new_v4();

    manager
        .add_long(tenant_id, user_id, "Keyboard layout is Colemak", 0.8, &[])
        .await
        .expect("add");

    vectors.set_degraded(true);
    let outcome = manager
        .query(
            MemoryScope::User { tenant_id, user_id },
            "which keyboard layout",
            5,
            None,
        )
        .await
        .expect("query");
    assert!(outcome.degraded, "degradation is tagged");
    assert_eq!(outcome.hits.len(), 1, "keyword ranking still finds it");
}
