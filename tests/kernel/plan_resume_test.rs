//! Plan suspension and acknowledgement resume across requests.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use armitage::config::{Config, RuntimePaths};
use armitage::providers::{
    FinishReason, LanguageModel, LlmRequest, LlmResponse, ProviderError, UsageStats,
};
use armitage::runtime::{Providers, Runtime};
use armitage::store::Store;
use armitage::tools::builtin::{SearchProvider, SearchResult};
use armitage::tools::ToolError;
use armitage::types::PlanStatus;

/// Planner answers research requests with a search → wait → respond plan
/// and everything else with an empty plan; every other call echoes.
struct PlanOnceModel;

#[async_trait]
impl LanguageModel for PlanOnceModel {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, ProviderError> {
        let system = request.system.as_deref().unwrap_or_default();
        let user_text = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let text = if system.contains("planning stage") {
            if user_text.contains("research") {
                r#"{"steps":[
                    {"type":"tool","tool_name":"web_search","args":{"query":"ACME Corp"}},
                    {"type":"wait_user","question":"Want details?"},
                    {"type":"respond","draft":"Summarise the search results."}
                ]}"#
                .to_owned()
            } else {
                r#"{"steps":[]}"#.to_owned()
            }
        } else if system.contains("extract durable knowledge") {
            "[]".to_owned()
        } else if system.contains("compare two statements") {
            r#"{"contradiction":false,"confidence":0.0}"#.to_owned()
        } else {
            "Here is the summary you asked for.".to_owned()
        };
        Ok(LlmResponse {
            text,
            tool_calls: vec![],
            finish_reason: FinishReason::EndTurn,
            usage: UsageStats::default(),
        })
    }

    fn model_id(&self) -> &str {
        "plan-once"
    }
}

struct StubSearch;

#[async_trait]
impl SearchProvider for StubSearch {
    async fn search(&self, query: &str, _limit: usize) -> Result<Vec<SearchResult>, ToolError> {
        Ok(vec![SearchResult {
            title: format!("{query} homepage"),
            url: "https://acme.example".to_owned(),
            snippet: "All about ACME.".to_owned(),
        }])
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

async fn runtime() -> (Runtime, Arc<Store>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(Store::open_in_memory().await.expect("open"));
    let providers = Providers {
        model: Arc::new(PlanOnceModel),
        search: Some(Arc::new(StubSearch)),
        ..Providers::default()
    };
    let runtime =
        Runtime::start_with_store(&Config::default(), &paths(&dir), providers, store.clone())
            .await
            .expect("start");
    (runtime, store, dir)
}

#[tokio::test]
async fn test_wait_user_suspends_then_acknowledgement_resumes() {
    let (runtime, store, _dir) = runtime().await;
    let tenant_id = Uuid::new_v4();
    let session = store
        .create_session(tenant_id, Uuid::new_v4(), "research")
        .await
        .expect("session");

    // First request: the plan runs its search and suspends at the wait.
    let first = runtime
        .handle_message(tenant_id, session.id, "research ACME Corp for me", false)
        .await
        .expect("first");
    assert_eq!(first.text, "Want details?");
    assert_eq!(first.plan_status, Some(PlanStatus::WaitingUser));

    // The suspension is persisted on the session.
    let stored = store
        .get_session(tenant_id, session.id)
        .await
        .expect("get")
        .expect("present");
    let pending = stored.pending_plan().expect("plan persisted");
    assert_eq!(pending.status, PlanStatus::WaitingUser);
    assert_eq!(pending.current_step_index, 2);
    let plan_id = pending.id;

    // Second request: a short Italian acknowledgement resumes — even with
    // a force_web_search flag, which the override drops.
    let second = runtime
        .handle_message(tenant_id, session.id, "sì, grazie", true)
        .await
        .expect("second");
    assert_eq!(second.plan_status, Some(PlanStatus::Completed));
    assert!(second.text.contains("summary"));

    // No new plan was created and the pending slot is cleared.
    let stored = store
        .get_session(tenant_id, session.id)
        .await
        .expect("get")
        .expect("present");
    assert!(stored.pending_plan().is_none(), "completed plan is cleared");

    // Resume idempotence: the same acknowledgement again does not revive
    // the plan or create another one.
    let third = runtime
        .handle_message(tenant_id, session.id, "sì, grazie", false)
        .await
        .expect("third");
    assert_ne!(third.plan_status, Some(PlanStatus::WaitingUser));
    let stored = store
        .get_session(tenant_id, session.id)
        .await
        .expect("get")
        .expect("present");
    assert!(stored.pending_plan().is_none());
    assert_ne!(
        stored.pending_plan().map(|p| p.id),
        Some(plan_id),
        "the original plan does not come back"
    );

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_at_most_one_pending_plan_per_session() {
    let (runtime, store, _dir) = runtime().await;
    let tenant_id = Uuid::new_v4();
    let session = store
        .create_session(tenant_id, Uuid::new_v4(), "research")
        .await
        .expect("session");

    let first = runtime
        .handle_message(tenant_id, session.id, "research ACME Corp for me", false)
        .await
        .expect("first");
    assert_eq!(first.plan_status, Some(PlanStatus::WaitingUser));
    let first_plan = store
        .get_session(tenant_id, session.id)
        .await
        .expect("get")
        .expect("present")
        .pending_plan()
        .expect("plan");

    // A new full request (not an acknowledgement) produces a new plan
    // that suspends too; it replaces the old one instead of stacking.
    let second = runtime
        .handle_message(tenant_id, session.id, "now research Initech instead", false)
        .await
        .expect("second");
    assert_eq!(second.plan_status, Some(PlanStatus::WaitingUser));

    let stored = store
        .get_session(tenant_id, session.id)
        .await
        .expect("get")
        .expect("present");
    let pending = stored.pending_plan().expect("one plan");
    assert_ne!(pending.id, first_plan.id, "the newer plan replaced the older");

    runtime.shutdown().await;
}
