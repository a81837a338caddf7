//! End-to-end scenarios through the assembled runtime.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use armitage::config::{Config, RuntimePaths};
use armitage::providers::{
    FinishReason, LanguageModel, LlmRequest, LlmResponse, ProviderError, UsageStats,
};
use armitage::runtime::{Providers, Runtime};
use armitage::store::notifications::NotificationFilter;
use armitage::store::Store;
use armitage::types::{Channel, Priority};

/// Routes by system prompt so one model serves the planner, the main
/// agent, knowledge extraction, and integrity comparisons.
struct RoutedModel {
    plan: String,
    extraction: String,
    comparison: String,
}

#[async_trait]
impl LanguageModel for RoutedModel {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, ProviderError> {
        let system = request.system.as_deref().unwrap_or_default();
        let text = if system.contains("planning stage") {
            self.plan.clone()
        } else if system.contains("extract durable knowledge") {
            self.extraction.clone()
        } else if system.contains("compare two statements") {
            self.comparison.clone()
        } else {
            let last = request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            format!("assistant reply about: {last}")
        };
        Ok(LlmResponse {
            text,
            tool_calls: vec![],
            finish_reason: FinishReason::EndTurn,
            usage: UsageStats {
                input_tokens: 10,
                output_tokens: 10,
            },
        })
    }

    fn model_id(&self) -> &str {
        "routed"
    }
}

fn paths(dir: &tempfile::TempDir) -> RuntimePaths {
    RuntimePaths {
        root: dir.path().to_path_buf(),
        logs_dir: dir.path().join("logs"),
        db_path: dir.path().join("armitage.db"),
        health_json: dir.path().join("health.json"),
    }
}

async fn runtime_with(model: RoutedModel) -> (Runtime, Arc<Store>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(Store::open_in_memory().await.expect("open"));
    let providers = Providers {
        model: Arc::new(model),
        ..Providers::default()
    };
    let runtime = Runtime::start_with_store(&Config::default(), &paths(&dir), providers, store.clone())
        .await
        .expect("start");
    (runtime, store, dir)
}

#[tokio::test]
async fn test_contradiction_detected_without_delaying_response() {
    // Long-term memory holds a birth date; the user states a different
    // one. The reply must come back normally while the background check
    // publishes a blocking notification.
    let (runtime, store, _dir) = runtime_with(RoutedModel {
        plan: r#"{"steps":[]}"#.to_owned(),
        extraction:
            r#"[{"kind":"fact","importance":0.9,"text":"Born on August 15, 1990"}]"#.to_owned(),
        comparison:
            r#"{"contradiction":true,"confidence":0.97,"rationale":"dates differ"}"#.to_owned(),
    })
    .await;

    let tenant_id = Uuid::new_v4();
    let user_id = Uuid::new_v4();
    let session = store
        .create_session(tenant_id, user_id, "chat")
        .await
        .expect("session");

    runtime
        .memory
        .add_long(tenant_id, user_id, "Born on July 12, 1990", 0.9, &[])
        .await
        .expect("seed");

    let response = runtime
        .handle_message(tenant_id, session.id, "Sono nato il 15 agosto 1990", false)
        .await
        .expect("handled");
    assert!(
        response.text.contains("agosto"),
        "the user gets a normal reply immediately"
    );

    // The background pass lands shortly after.
    let mut blocking = Vec::new();
    for _ in 0..50 {
        let page = runtime
            .notify
            .list(&NotificationFilter::for_user(tenant_id, user_id))
            .await
            .expect("list");
        blocking = page
            .into_iter()
            .filter(|n| n.kind == "contradiction_detected")
            .collect();
        if !blocking.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(blocking.len(), 1, "exactly one contradiction notification");
    assert_eq!(blocking[0].channel, Channel::Blocking);
    assert_eq!(blocking[0].priority, Priority::Critical);
    assert!(blocking[0].payload["confidence"]
        .as_f64()
        .is_some_and(|c| c >= 0.90));
    assert!(blocking[0].payload["existing"]
        .as_str()
        .is_some_and(|s| s.contains("July 12")));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_empty_message_prompts_and_writes_nothing() {
    let (runtime, store, _dir) = runtime_with(RoutedModel {
        plan: r#"{"steps":[]}"#.to_owned(),
        extraction: "[]".to_owned(),
        comparison: r#"{"contradiction":false,"confidence":0.0}"#.to_owned(),
    })
    .await;

    let tenant_id = Uuid::new_v4();
    let session = store
        .create_session(tenant_id, Uuid::new_v4(), "chat")
        .await
        .expect("session");

    let response = runtime
        .handle_message(tenant_id, session.id, "", false)
        .await
        .expect("handled");
    assert!(
        response.text.contains("didn't receive any text"),
        "empty input prompts for input, got {:?}",
        response.text
    );

    // Only the assistant prompt-for-input is persisted; the empty user
    // turn is not.
    let messages = store
        .list_messages(tenant_id, session.id, 0, 10)
        .await
        .expect("messages");
    assert_eq!(messages.len(), 1);
    assert_eq!(
        messages[0].message.role,
        armitage::types::MessageRole::Assistant
    );

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_archived_session_rejects_messages() {
    let (runtime, store, _dir) = runtime_with(RoutedModel {
        plan: r#"{"steps":[]}"#.to_owned(),
        extraction: "[]".to_owned(),
        comparison: r#"{"contradiction":false,"confidence":0.0}"#.to_owned(),
    })
    .await;

    let tenant_id = Uuid::new_v4();
    let session = store
        .create_session(tenant_id, Uuid::new_v4(), "old")
        .await
        .expect("session");
    store
        .append_message(armitage::types::Message::new(
            session.id,
            tenant_id,
            armitage::types::MessageRole::User,
            "kept after archive",
        ))
        .await
        .expect("append");
    store
        .archive_session(tenant_id, session.id)
        .await
        .expect("archive");

    let result = runtime
        .handle_message(tenant_id, session.id, "anyone there?", false)
        .await;
    assert!(result.is_err(), "archived sessions take no new requests");

    // Soft delete: history is still readable.
    let messages = store
        .list_messages(tenant_id, session.id, 0, 10)
        .await
        .expect("messages");
    assert_eq!(messages.len(), 1);

    runtime.shutdown().await;
}
