//! Tool invocation pipeline.
//!
//! `invoke` validates arguments, enforces the per-tool timeout, retries
//! transient failures with jittered exponential backoff, and auto-indexes
//! index-worthy results into long-term memory. Errors are encoded into the
//! returned record, never thrown past this boundary.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::memory::MemoryManager;

use super::{validate_args, ToolContext, ToolError, ToolRegistry};

/// Base backoff before the second attempt; doubles each retry.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Jitter applied to each backoff, as a fraction of the delay.
const BACKOFF_JITTER: f64 = 0.2;

/// Importance assigned to auto-indexed tool results.
const AUTO_INDEX_IMPORTANCE: f64 = 0.4;

/// Structured failure carried inside an [`InvokeRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolFailure {
    /// Stable error kind tag.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Whether a retry with the same arguments may succeed.
    pub retriable: bool,
}

impl From<&ToolError> for ToolFailure {
    fn from(err: &ToolError) -> Self {
        Self {
            kind: err.kind().to_owned(),
            message: err.to_string(),
            retriable: err.retriable(),
        }
    }
}

/// Counters from a best-effort auto-index pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexingStats {
    /// Items written to long-term memory.
    pub indexed: u32,
    /// Items that failed to index (logged, never fatal).
    pub failed: u32,
}

/// Outcome of a tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeRecord {
    /// Tool name.
    pub tool_name: String,
    /// Attempts made (1 when the first try succeeded).
    pub attempts: u32,
    /// Success value or encoded failure.
    pub result: Result<serde_json::Value, ToolFailure>,
    /// Present when the result was auto-indexed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexing_stats: Option<IndexingStats>,
}

impl InvokeRecord {
    /// Whether the invocation succeeded.
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Tool invoker over a registry.
pub struct ToolInvoker {
    registry: Arc<ToolRegistry>,
    memory: Arc<MemoryManager>,
    default_timeout_secs: u64,
    max_timeout_secs: u64,
    max_attempts: u32,
}

impl std::fmt::Debug for ToolInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolInvoker")
            .field("tools", &self.registry.len())
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl ToolInvoker {
    /// Create an invoker.
    pub fn new(
        registry: Arc<ToolRegistry>,
        memory: Arc<MemoryManager>,
        default_timeout_secs: u64,
        max_timeout_secs: u64,
        max_attempts: u32,
    ) -> Self {
        Self {
            registry,
            memory,
            default_timeout_secs,
            max_timeout_secs,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Invoke a tool by name.
    ///
    /// Never returns an error: failures are encoded in the record so the
    /// caller (the tool loop) can degrade gracefully.
    pub async fn invoke(
        &self,
        tool_name: &str,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> InvokeRecord {
        let Some(tool) = self.registry.get(tool_name) else {
            return InvokeRecord {
                tool_name: tool_name.to_owned(),
                attempts: 0,
                result: Err((&ToolError::NotFound(tool_name.to_owned())).into()),
                indexing_stats: None,
            };
        };

        let descriptor = tool.descriptor();

        if let Err(err) = validate_args(&descriptor.args_schema, &args) {
            return InvokeRecord {
                tool_name: tool_name.to_owned(),
                attempts: 0,
                result: Err((&err).into()),
                indexing_stats: None,
            };
        }

        let timeout_secs = descriptor
            .timeout_secs
            .unwrap_or(self.default_timeout_secs)
            .min(self.max_timeout_secs);
        let timeout = Duration::from_secs(timeout_secs);

        let mut attempts = 0u32;
        let mut last_error = ToolError::Internal("no attempt made".to_owned());

        while attempts < self.max_attempts {
            attempts = attempts.saturating_add(1);

            let attempt =
                tokio::time::timeout(timeout, tool.execute(args.clone(), ctx)).await;
            let result = match attempt {
                Ok(inner) => inner,
                Err(_) => Err(ToolError::Timeout(timeout_secs)),
            };

            match result {
                Ok(value) => {
                    debug!(tool = tool_name, attempts, "tool call succeeded");
                    let indexing_stats = if descriptor.index_worthy {
                        Some(self.auto_index(tool_name, &value, ctx).await)
                    } else {
                        None
                    };
                    return InvokeRecord {
                        tool_name: tool_name.to_owned(),
                        attempts,
                        result: Ok(value),
                        indexing_stats,
                    };
                }
                Err(err) => {
                    let will_retry = err.retriable() && attempts < self.max_attempts;
                    warn!(
                        tool = tool_name,
                        attempts,
                        error = %err,
                        will_retry,
                        "tool call failed"
                    );
                    if !will_retry {
                        last_error = err;
                        break;
                    }
                    tokio::time::sleep(backoff_delay(attempts)).await;
                    last_error = err;
                }
            }
        }

        InvokeRecord {
            tool_name: tool_name.to_owned(),
            attempts,
            result: Err((&last_error).into()),
            indexing_stats: None,
        }
    }

    /// Best-effort write of a tool result into long-term memory.
    ///
    /// Indexing failures are logged and never fail the tool call.
    async fn auto_index(
        &self,
        tool_name: &str,
        value: &serde_json::Value,
        ctx: &ToolContext,
    ) -> IndexingStats {
        let mut stats = IndexingStats::default();
        let sources: Vec<uuid::Uuid> = ctx.session_id.into_iter().collect();

        for text in indexable_texts(value) {
            match self
                .memory
                .add_long(ctx.tenant_id, ctx.user_id, &text, AUTO_INDEX_IMPORTANCE, &sources)
                .await
            {
                Ok(_) => stats.indexed = stats.indexed.saturating_add(1),
                Err(err) => {
                    warn!(tool = tool_name, error = %err, "auto-index write failed");
                    stats.failed = stats.failed.saturating_add(1);
                }
            }
        }

        if stats.indexed > 0 {
            info!(tool = tool_name, indexed = stats.indexed, "tool result auto-indexed");
        }
        stats
    }
}

/// Jittered exponential backoff: 1s, 2s, 4s (±20%).
fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(8);
    let base = BACKOFF_BASE.saturating_mul(1u32 << exponent);
    let jitter = rand::thread_rng().gen_range(1.0 - BACKOFF_JITTER..=1.0 + BACKOFF_JITTER);
    base.mul_f64(jitter)
}

/// Extract index-worthy text snippets from a tool result.
///
/// Result arrays of `{title, url?, snippet?/content?}` become one entry
/// each ("title — snippet"); a bare `{title, content}` object becomes a
/// single entry. Anything else yields nothing.
fn indexable_texts(value: &serde_json::Value) -> Vec<String> {
    fn entry_text(item: &serde_json::Value) -> Option<String> {
        let title = item.get("title").and_then(|t| t.as_str())?;
        let body = item
            .get("snippet")
            .or_else(|| item.get("content"))
            .or_else(|| item.get("summary"))
            .and_then(|s| s.as_str())
            .unwrap_or_default();
        let url = item.get("url").and_then(|u| u.as_str());
        let mut text = title.to_owned();
        if !body.is_empty() {
            text.push_str(": ");
            text.push_str(body);
        }
        if let Some(url) = url {
            text.push_str(" (");
            text.push_str(url);
            text.push(')');
        }
        Some(text)
    }

    if let Some(results) = value.get("results").and_then(|r| r.as_array()) {
        return results.iter().filter_map(entry_text).collect();
    }
    entry_text(value).into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::vector::{HashEmbedder, InMemoryVectorStore};
    use crate::memory::MemoryScope;
    use crate::store::Store;
    use crate::tools::{SideEffect, Tool, ToolDescriptor};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    /// Fails with transient errors N times, then succeeds.
    struct FlakyTool {
        failures: AtomicU32,
        index_worthy: bool,
    }

    impl FlakyTool {
        fn new(failures: u32, index_worthy: bool) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                index_worthy,
            }
        }
    }

    #[async_trait]
    impl Tool for FlakyTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor {
                name: "web_search".to_owned(),
                what: "Search the web.".to_owned(),
                when_to_use: "current information is needed".to_owned(),
                args_schema: json!({
                    "type": "object",
                    "properties": { "query": { "type": "string" } },
                    "required": ["query"]
                }),
                side_effect: SideEffect::Read,
                index_worthy: self.index_worthy,
                timeout_secs: None,
            }
        }

        async fn execute(
            &self,
            args: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<serde_json::Value, ToolError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ToolError::Upstream("gateway timeout".to_owned()));
            }
            Ok(json!({
                "results": [
                    { "title": format!("{} overview", args["query"].as_str().unwrap_or("")),
                      "url": "https://example.com", "snippet": "An overview." }
                ]
            }))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor {
                name: "slow".to_owned(),
                what: "Sleeps forever.".to_owned(),
                when_to_use: "never".to_owned(),
                args_schema: json!({"type": "object", "properties": {}}),
                side_effect: SideEffect::Pure,
                index_worthy: false,
                timeout_secs: Some(1),
            }
        }

        async fn execute(
            &self,
            _args: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<serde_json::Value, ToolError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(json!({}))
        }
    }

    async fn invoker_with(tool: Arc<dyn Tool>) -> (ToolInvoker, Arc<MemoryManager>) {
        let store = Arc::new(Store::open_in_memory().await.expect("open"));
        let memory = Arc::new(MemoryManager::new(
            store,
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(HashEmbedder::default()),
            0.7,
            30,
            20,
        ));
        let mut registry = ToolRegistry::new();
        registry.register(tool);
        (
            ToolInvoker::new(Arc::new(registry), memory.clone(), 60, 600, 3),
            memory,
        )
    }

    #[tokio::test]
    async fn test_retry_then_success_with_backoff() {
        let (invoker, _) = invoker_with(Arc::new(FlakyTool::new(2, false))).await;
        tokio::time::pause();
        let ctx = ToolContext::for_user(Uuid::new_v4(), Uuid::new_v4());

        let started = tokio::time::Instant::now();
        let record = invoker
            .invoke("web_search", json!({"query": "ACME Corp"}), &ctx)
            .await;
        let elapsed = started.elapsed();

        assert!(record.is_ok(), "third attempt succeeds: {record:?}");
        assert_eq!(record.attempts, 3);
        // Backoffs of ~1s and ~2s with ±20% jitter.
        assert!(elapsed >= Duration::from_millis(2400), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(3700), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn test_retries_exhausted_reports_retriable_failure() {
        let (invoker, _) = invoker_with(Arc::new(FlakyTool::new(10, false))).await;
        tokio::time::pause();
        let ctx = ToolContext::for_user(Uuid::new_v4(), Uuid::new_v4());

        let record = invoker
            .invoke("web_search", json!({"query": "x"}), &ctx)
            .await;
        assert_eq!(record.attempts, 3);
        let failure = record.result.expect_err("exhausted");
        assert_eq!(failure.kind, "upstream_unavailable");
        assert!(failure.retriable);
    }

    #[tokio::test]
    async fn test_bad_args_never_retried() {
        let (invoker, _) = invoker_with(Arc::new(FlakyTool::new(0, false))).await;
        let ctx = ToolContext::for_user(Uuid::new_v4(), Uuid::new_v4());

        let record = invoker
            .invoke("web_search", json!({"query": "x", "bogus": true}), &ctx)
            .await;
        assert_eq!(record.attempts, 0, "validation failures skip execution");
        let failure = record.result.expect_err("bad args");
        assert_eq!(failure.kind, "bad_args");
        assert!(!failure.retriable);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let (invoker, _) = invoker_with(Arc::new(FlakyTool::new(0, false))).await;
        let ctx = ToolContext::for_user(Uuid::new_v4(), Uuid::new_v4());
        let record = invoker.invoke("nope", json!({}), &ctx).await;
        assert_eq!(record.result.expect_err("missing").kind, "not_found");
    }

    #[tokio::test]
    async fn test_timeout_maps_to_transport_timeout() {
        let (invoker, _) = invoker_with(Arc::new(SlowTool)).await;
        tokio::time::pause();
        let ctx = ToolContext::for_user(Uuid::new_v4(), Uuid::new_v4());

        let record = invoker.invoke("slow", json!({}), &ctx).await;
        let failure = record.result.expect_err("timeout");
        assert_eq!(failure.kind, "transport_timeout");
        assert!(failure.retriable);
        assert_eq!(record.attempts, 3, "timeouts are retried");
    }

    #[tokio::test]
    async fn test_auto_index_roundtrip() {
        let (invoker, memory) = invoker_with(Arc::new(FlakyTool::new(0, true))).await;
        let tenant_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let mut ctx = ToolContext::for_user(tenant_id, user_id);
        ctx.session_id = Some(Uuid::new_v4());

        let record = invoker
            .invoke("web_search", json!({"query": "ACME Corp"}), &ctx)
            .await;
        let stats = record.indexing_stats.expect("index-worthy tool");
        assert_eq!(stats.indexed, 1);
        assert_eq!(stats.failed, 0);

        // The indexed item is findable by its title.
        let outcome = memory
            .query(
                MemoryScope::User { tenant_id, user_id },
                "ACME Corp overview",
                3,
                None,
            )
            .await
            .expect("query");
        assert!(
            outcome.hits.iter().any(|h| h.content.contains("ACME Corp")),
            "auto-indexed result is retrievable"
        );
    }

    #[test]
    fn test_indexable_texts_shapes() {
        let many = json!({
            "results": [
                { "title": "A", "snippet": "alpha" },
                { "title": "B", "url": "https://b.example" },
                { "noise": true }
            ]
        });
        let texts = indexable_texts(&many);
        assert_eq!(texts.len(), 2);
        assert!(texts[0].contains("A: alpha"));
        assert!(texts[1].contains("https://b.example"));

        let single = json!({ "title": "Page", "content": "body" });
        assert_eq!(indexable_texts(&single).len(), 1);

        assert!(indexable_texts(&json!("plain string")).is_empty());
    }
}
