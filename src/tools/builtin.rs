//! Built-in tools.
//!
//! Registered before integration- and server-derived tools so their names
//! always win. Web search and browser snapshots delegate to collaborator
//! traits (the core stays vendor-agnostic); web fetch is plain HTTP;
//! memory tools are wired straight to the memory manager.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::instrument;

use crate::memory::{MemoryManager, MemoryScope};

use super::{SideEffect, Tool, ToolContext, ToolDescriptor, ToolError};

/// Maximum bytes of fetched page body returned to the caller.
const FETCH_BODY_LIMIT: usize = 64 * 1024;

/// Default result count for web search.
const DEFAULT_SEARCH_RESULTS: u64 = 5;

/// One web search result, normalised by the provider.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SearchResult {
    /// Page title.
    pub title: String,
    /// Page URL.
    pub url: String,
    /// Short excerpt.
    pub snippet: String,
}

/// Web search collaborator.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Run a search, returning up to `limit` results.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, ToolError>;
}

/// Headless-browser collaborator for page snapshots.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Render a page and return its visible text.
    ///
    /// # Errors
    ///
    /// Returns an error if the page cannot be rendered.
    async fn snapshot(&self, url: &str) -> Result<String, ToolError>;
}

// ---------------------------------------------------------------------------
// web_search
// ---------------------------------------------------------------------------

/// Web search over a [`SearchProvider`]. Index-worthy.
pub struct WebSearchTool {
    provider: Arc<dyn SearchProvider>,
}

impl WebSearchTool {
    /// Wrap a search provider.
    pub fn new(provider: Arc<dyn SearchProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "web_search".to_owned(),
            what: "Search the web and return titled results with snippets.".to_owned(),
            when_to_use: "the answer needs current or external information".to_owned(),
            args_schema: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "limit": { "type": "integer" }
                },
                "required": ["query"]
            }),
            side_effect: SideEffect::Read,
            index_worthy: true,
            timeout_secs: None,
        }
    }

    #[instrument(skip(self, args, _ctx), fields(tool = "web_search"))]
    async fn execute(
        &self,
        args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let query = args
            .get("query")
            .and_then(|q| q.as_str())
            .ok_or_else(|| ToolError::BadArgs("missing 'query'".to_owned()))?;
        let limit = args
            .get("limit")
            .and_then(|l| l.as_u64())
            .unwrap_or(DEFAULT_SEARCH_RESULTS);
        let limit = usize::try_from(limit.min(20)).unwrap_or(5);

        let results = self.provider.search(query, limit).await?;
        Ok(json!({ "query": query, "results": results }))
    }
}

// ---------------------------------------------------------------------------
// web_fetch
// ---------------------------------------------------------------------------

/// Plain HTTP page fetch. Index-worthy.
pub struct WebFetchTool {
    client: reqwest::Client,
}

impl WebFetchTool {
    /// Create a fetch tool with its own HTTP client.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "web_fetch".to_owned(),
            what: "Fetch a URL and return its body text.".to_owned(),
            when_to_use: "a specific page's content is needed".to_owned(),
            args_schema: json!({
                "type": "object",
                "properties": { "url": { "type": "string" } },
                "required": ["url"]
            }),
            side_effect: SideEffect::Read,
            index_worthy: true,
            timeout_secs: None,
        }
    }

    #[instrument(skip(self, args, _ctx), fields(tool = "web_fetch"))]
    async fn execute(
        &self,
        args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let url = args
            .get("url")
            .and_then(|u| u.as_str())
            .ok_or_else(|| ToolError::BadArgs("missing 'url'".to_owned()))?;
        let parsed = url::Url::parse(url)
            .map_err(|e| ToolError::BadArgs(format!("invalid url: {e}")))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(ToolError::BadArgs(format!(
                "unsupported scheme {:?}",
                parsed.scheme()
            )));
        }

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| ToolError::Upstream(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ToolError::Upstream(format!("status {status}")));
        }
        if !status.is_success() {
            return Err(ToolError::BadArgs(format!("status {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ToolError::Upstream(e.to_string()))?;
        let mut text = body;
        text.truncate(FETCH_BODY_LIMIT);

        Ok(json!({ "title": url, "content": text }))
    }
}

// ---------------------------------------------------------------------------
// browser_snapshot
// ---------------------------------------------------------------------------

/// Rendered-page snapshot over a [`SnapshotProvider`]. Index-worthy.
pub struct BrowserSnapshotTool {
    provider: Arc<dyn SnapshotProvider>,
}

impl BrowserSnapshotTool {
    /// Wrap a snapshot provider.
    pub fn new(provider: Arc<dyn SnapshotProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Tool for BrowserSnapshotTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "browser_snapshot".to_owned(),
            what: "Render a page in a browser and return its visible text.".to_owned(),
            when_to_use: "the page needs scripting to render".to_owned(),
            args_schema: json!({
                "type": "object",
                "properties": { "url": { "type": "string" } },
                "required": ["url"]
            }),
            side_effect: SideEffect::External,
            index_worthy: true,
            timeout_secs: Some(120),
        }
    }

    #[instrument(skip(self, args, _ctx), fields(tool = "browser_snapshot"))]
    async fn execute(
        &self,
        args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let url = args
            .get("url")
            .and_then(|u| u.as_str())
            .ok_or_else(|| ToolError::BadArgs("missing 'url'".to_owned()))?;
        let text = self.provider.snapshot(url).await?;
        Ok(json!({ "title": url, "content": text }))
    }
}

// ---------------------------------------------------------------------------
// email_summary
// ---------------------------------------------------------------------------

/// Summarise recent unread mail across the user's enabled email
/// integrations. Index-worthy.
pub struct EmailSummaryTool {
    store: Arc<crate::store::Store>,
    provider: Arc<dyn crate::pollers::EmailProvider>,
}

impl EmailSummaryTool {
    /// Wrap the store and the email collaborator.
    pub fn new(
        store: Arc<crate::store::Store>,
        provider: Arc<dyn crate::pollers::EmailProvider>,
    ) -> Self {
        Self { store, provider }
    }
}

#[async_trait]
impl Tool for EmailSummaryTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "email_summary".to_owned(),
            what: "Summarise recent unread emails across connected accounts.".to_owned(),
            when_to_use: "the user asks what is in their inbox".to_owned(),
            args_schema: json!({
                "type": "object",
                "properties": { "hours": { "type": "integer" } }
            }),
            side_effect: SideEffect::Read,
            index_worthy: true,
            timeout_secs: None,
        }
    }

    #[instrument(skip(self, args, ctx), fields(tool = "email_summary"))]
    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let hours = args.get("hours").and_then(|h| h.as_i64()).unwrap_or(24);
        let since = chrono::Utc::now()
            .checked_sub_signed(chrono::Duration::hours(hours.clamp(1, 168)))
            .unwrap_or_else(chrono::Utc::now);

        let integrations = self
            .store
            .list_user_integrations(ctx.tenant_id, ctx.user_id)
            .await
            .map_err(|e| ToolError::Internal(e.to_string()))?;

        let mut lines = Vec::new();
        for integration in integrations
            .iter()
            .filter(|i| i.enabled && i.service == crate::types::ServiceKind::Email)
        {
            let messages = self
                .provider
                .list_unread(integration, since, 20)
                .await
                .map_err(|e| ToolError::Upstream(e.to_string()))?;
            for message in messages {
                lines.push(format!("{}: {}", message.from, message.subject));
            }
        }

        Ok(json!({
            "title": "Email summary",
            "content": if lines.is_empty() {
                "No unread mail.".to_owned()
            } else {
                lines.join("\n")
            },
            "count": lines.len(),
        }))
    }
}

// ---------------------------------------------------------------------------
// memory tools
// ---------------------------------------------------------------------------

/// Query long-term memory. Pure read; not index-worthy.
pub struct MemorySearchTool {
    memory: Arc<MemoryManager>,
}

impl MemorySearchTool {
    /// Wrap the memory manager.
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "memory_search".to_owned(),
            what: "Search the user's long-term memory.".to_owned(),
            when_to_use: "the answer may already be known about the user".to_owned(),
            args_schema: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "limit": { "type": "integer" }
                },
                "required": ["query"]
            }),
            side_effect: SideEffect::Read,
            index_worthy: false,
            timeout_secs: None,
        }
    }

    #[instrument(skip(self, args, ctx), fields(tool = "memory_search"))]
    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let query = args
            .get("query")
            .and_then(|q| q.as_str())
            .ok_or_else(|| ToolError::BadArgs("missing 'query'".to_owned()))?;
        let limit = args.get("limit").and_then(|l| l.as_u64()).unwrap_or(5);
        let limit = usize::try_from(limit.min(20)).unwrap_or(5);

        let outcome = self
            .memory
            .query(
                MemoryScope::User {
                    tenant_id: ctx.tenant_id,
                    user_id: ctx.user_id,
                },
                query,
                limit,
                None,
            )
            .await
            .map_err(|e| ToolError::Internal(e.to_string()))?;

        let hits: Vec<serde_json::Value> = outcome
            .hits
            .iter()
            .map(|h| json!({ "content": h.content, "score": h.score }))
            .collect();
        Ok(json!({ "hits": hits, "degraded": outcome.degraded }))
    }
}

/// Save an explicit fact into long-term memory.
pub struct MemorySaveTool {
    memory: Arc<MemoryManager>,
}

impl MemorySaveTool {
    /// Wrap the memory manager.
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemorySaveTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "memory_save".to_owned(),
            what: "Save a fact or preference to the user's long-term memory.".to_owned(),
            when_to_use: "the user asks to be remembered something".to_owned(),
            args_schema: json!({
                "type": "object",
                "properties": {
                    "content": { "type": "string" },
                    "importance": { "type": "number" }
                },
                "required": ["content"]
            }),
            side_effect: SideEffect::Write,
            index_worthy: false,
            timeout_secs: None,
        }
    }

    #[instrument(skip(self, args, ctx), fields(tool = "memory_save"))]
    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let content = args
            .get("content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| ToolError::BadArgs("missing 'content'".to_owned()))?;
        let importance = args
            .get("importance")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.7);
        let sources: Vec<uuid::Uuid> = ctx.session_id.into_iter().collect();

        let memory = self
            .memory
            .add_long(ctx.tenant_id, ctx.user_id, content, importance, &sources)
            .await
            .map_err(|e| ToolError::Internal(e.to_string()))?;

        Ok(json!({ "id": memory.id, "importance": memory.importance }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::vector::{HashEmbedder, InMemoryVectorStore};
    use crate::store::Store;
    use uuid::Uuid;

    struct FixedSearch;

    #[async_trait]
    impl SearchProvider for FixedSearch {
        async fn search(
            &self,
            query: &str,
            limit: usize,
        ) -> Result<Vec<SearchResult>, ToolError> {
            Ok(vec![SearchResult {
                title: format!("{query} result"),
                url: "https://example.com".to_owned(),
                snippet: "snippet".to_owned(),
            }]
            .into_iter()
            .take(limit)
            .collect())
        }
    }

    async fn memory() -> Arc<MemoryManager> {
        let store = Arc::new(Store::open_in_memory().await.expect("open"));
        Arc::new(MemoryManager::new(
            store,
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(HashEmbedder::default()),
            0.7,
            30,
            20,
        ))
    }

    #[tokio::test]
    async fn test_web_search_shapes_results() {
        let tool = WebSearchTool::new(Arc::new(FixedSearch));
        let ctx = ToolContext::for_user(Uuid::new_v4(), Uuid::new_v4());

        let value = tool
            .execute(json!({"query": "rust async"}), &ctx)
            .await
            .expect("search");
        assert_eq!(value["results"][0]["title"], "rust async result");
        assert!(tool.descriptor().index_worthy);
    }

    #[tokio::test]
    async fn test_web_fetch_rejects_bad_scheme() {
        let tool = WebFetchTool::new();
        let ctx = ToolContext::for_user(Uuid::new_v4(), Uuid::new_v4());

        let err = tool
            .execute(json!({"url": "ftp://example.com"}), &ctx)
            .await
            .expect_err("scheme");
        assert!(matches!(err, ToolError::BadArgs(_)));

        let err = tool
            .execute(json!({"url": "not a url"}), &ctx)
            .await
            .expect_err("parse");
        assert!(matches!(err, ToolError::BadArgs(_)));
    }

    #[tokio::test]
    async fn test_memory_save_then_search() {
        let memory = memory().await;
        let save = MemorySaveTool::new(memory.clone());
        let search = MemorySearchTool::new(memory);
        let ctx = ToolContext::for_user(Uuid::new_v4(), Uuid::new_v4());

        save.execute(json!({"content": "Speaks Italian fluently"}), &ctx)
            .await
            .expect("save");

        let value = search
            .execute(json!({"query": "Italian language"}), &ctx)
            .await
            .expect("search");
        let hits = value["hits"].as_array().expect("hits");
        assert!(!hits.is_empty());
        assert!(hits[0]["content"]
            .as_str()
            .expect("content")
            .contains("Italian"));
    }
}
