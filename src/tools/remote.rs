//! External tool servers and dynamic tool registration.
//!
//! A tool server exposes `list_tools` / `call_tool`; every discovered tool
//! is wrapped in a [`RemoteTool`] adapter and registered. Name precedence:
//! built-ins are registered first and always win — a server tool whose
//! name collides is registered under `{server}.{name}` instead, so both
//! remain callable and the built-in keeps the bare name.
//!
//! Authentication is an opaque bearer blob taken from the integration; the
//! core forwards it untouched and does not retain it beyond the call.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::{SideEffect, Tool, ToolContext, ToolDescriptor, ToolError, ToolRegistry};

/// A tool as described by a remote server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteToolDescriptor {
    /// Name on the server.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the arguments.
    #[serde(default = "empty_object")]
    pub input_schema: serde_json::Value,
    /// Whether the server marks the tool read-only.
    #[serde(default)]
    pub read_only: bool,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// A remote tool server collaborator.
#[async_trait]
pub trait ToolServer: Send + Sync {
    /// Server name, used to prefix colliding tool names.
    fn server_name(&self) -> &str;

    /// Discover the server's tools.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is unreachable.
    async fn list_tools(&self) -> Result<Vec<RemoteToolDescriptor>, ToolError>;

    /// Invoke a tool on the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails; authentication problems map to
    /// [`ToolError::AuthRequired`].
    async fn call_tool(
        &self,
        name: &str,
        args: serde_json::Value,
        auth: Option<&[u8]>,
    ) -> Result<serde_json::Value, ToolError>;
}

/// Adapter exposing one remote tool through the [`Tool`] trait.
pub struct RemoteTool {
    server: Arc<dyn ToolServer>,
    /// Name on the server.
    remote_name: String,
    /// Name in the local registry (may carry a server prefix).
    local_name: String,
    description: String,
    input_schema: serde_json::Value,
    read_only: bool,
    /// Credential blob of the owning integration, used when the call
    /// context carries none. Opaque; forwarded as-is.
    default_auth: Option<Vec<u8>>,
}

#[async_trait]
impl Tool for RemoteTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.local_name.clone(),
            what: self.description.clone(),
            when_to_use: format!("delegating to the {} server", self.server.server_name()),
            args_schema: self.input_schema.clone(),
            side_effect: if self.read_only {
                SideEffect::Read
            } else {
                SideEffect::External
            },
            index_worthy: false,
            timeout_secs: None,
        }
    }

    #[instrument(skip(self, args, ctx), fields(tool = %self.local_name))]
    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let auth = ctx.auth.as_deref().or(self.default_auth.as_deref());
        self.server
            .call_tool(&self.remote_name, args, auth)
            .await
    }
}

/// Discover a server's tools and register them.
///
/// Returns the number of tools registered. Collisions with existing names
/// fall back to the `{server}.{name}` form; a collision even there is
/// skipped with a warning. `default_auth` is the opaque credential blob of
/// the integration that owns this server, if any.
///
/// # Errors
///
/// Returns an error if discovery fails; registration itself is infallible.
pub async fn register_server_tools(
    registry: &mut ToolRegistry,
    server: Arc<dyn ToolServer>,
    default_auth: Option<Vec<u8>>,
) -> Result<usize, ToolError> {
    let discovered = server.list_tools().await?;
    let mut registered = 0usize;

    for descriptor in discovered {
        let bare = descriptor.name.clone();
        let prefixed = format!("{}.{}", server.server_name(), descriptor.name);
        let local_name = if registry.contains(&bare) { prefixed } else { bare };

        if registry.contains(&local_name) {
            warn!(tool = %local_name, "skipping duplicate server tool");
            continue;
        }

        let tool = RemoteTool {
            server: server.clone(),
            remote_name: descriptor.name,
            local_name,
            description: descriptor.description,
            input_schema: descriptor.input_schema,
            read_only: descriptor.read_only,
            default_auth: default_auth.clone(),
        };
        if registry.register(Arc::new(tool)) {
            registered = registered.saturating_add(1);
        }
    }

    info!(
        server = server.server_name(),
        registered, "tool server registered"
    );
    Ok(registered)
}

/// HTTP tool server speaking a minimal JSON protocol:
/// `GET {base}/tools` for discovery, `POST {base}/tools/{name}` for calls,
/// bearer bytes forwarded in the `Authorization` header.
pub struct HttpToolServer {
    name: String,
    base_url: url::Url,
    client: reqwest::Client,
}

impl HttpToolServer {
    /// Create a client for the server at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn new(name: &str, base_url: &str) -> Result<Self, ToolError> {
        let base_url = url::Url::parse(base_url)
            .map_err(|e| ToolError::BadArgs(format!("invalid server url: {e}")))?;
        Ok(Self {
            name: name.to_owned(),
            base_url,
            client: reqwest::Client::new(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<url::Url, ToolError> {
        self.base_url
            .join(path)
            .map_err(|e| ToolError::Internal(format!("bad endpoint {path:?}: {e}")))
    }
}

#[async_trait]
impl ToolServer for HttpToolServer {
    fn server_name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<RemoteToolDescriptor>, ToolError> {
        let url = self.endpoint("tools")?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ToolError::Upstream(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::Upstream(format!("discovery status {status}")));
        }
        response
            .json()
            .await
            .map_err(|e| ToolError::Upstream(format!("bad discovery payload: {e}")))
    }

    async fn call_tool(
        &self,
        name: &str,
        args: serde_json::Value,
        auth: Option<&[u8]>,
    ) -> Result<serde_json::Value, ToolError> {
        let url = self.endpoint(&format!("tools/{name}"))?;
        let mut request = self.client.post(url).json(&args);
        if let Some(auth) = auth {
            request = request.header(
                reqwest::header::AUTHORIZATION,
                String::from_utf8_lossy(auth).into_owned(),
            );
        }

        let response = request
            .send()
            .await
            .map_err(|e| ToolError::Upstream(e.to_string()))?;

        match response.status() {
            status if status.is_success() => response
                .json()
                .await
                .map_err(|e| ToolError::Upstream(format!("bad result payload: {e}"))),
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => Err(
                ToolError::AuthRequired(format!("server {} rejected credentials", self.name)),
            ),
            status if status.is_server_error() => {
                let body = response.text().await.unwrap_or_default();
                Err(ToolError::Upstream(format!(
                    "status {status}: {}",
                    crate::providers::sanitize_error_body(&body)
                )))
            }
            status => Err(ToolError::BadArgs(format!("status {status}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::builtin::{SearchProvider, SearchResult, WebSearchTool};
    use serde_json::json;

    struct FakeServer;

    #[async_trait]
    impl ToolServer for FakeServer {
        fn server_name(&self) -> &str {
            "acme"
        }

        async fn list_tools(&self) -> Result<Vec<RemoteToolDescriptor>, ToolError> {
            Ok(vec![
                RemoteToolDescriptor {
                    name: "web_search".to_owned(),
                    description: "Server-side search".to_owned(),
                    input_schema: empty_object(),
                    read_only: true,
                },
                RemoteToolDescriptor {
                    name: "ticket_create".to_owned(),
                    description: "Create a ticket".to_owned(),
                    input_schema: empty_object(),
                    read_only: false,
                },
            ])
        }

        async fn call_tool(
            &self,
            name: &str,
            _args: serde_json::Value,
            auth: Option<&[u8]>,
        ) -> Result<serde_json::Value, ToolError> {
            if auth.is_none() {
                return Err(ToolError::AuthRequired("no token".to_owned()));
            }
            Ok(json!({ "called": name }))
        }
    }

    struct NullSearch;

    #[async_trait]
    impl SearchProvider for NullSearch {
        async fn search(
            &self,
            _query: &str,
            _limit: usize,
        ) -> Result<Vec<SearchResult>, ToolError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_builtin_wins_name_collision() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(WebSearchTool::new(Arc::new(NullSearch))));

        let count = register_server_tools(&mut registry, Arc::new(FakeServer), None)
            .await
            .expect("register");
        assert_eq!(count, 2);

        // The built-in keeps the bare name; the server variant is prefixed.
        assert!(registry.contains("web_search"));
        assert!(registry.contains("acme.web_search"));
        assert!(registry.contains("ticket_create"));

        let builtin = registry.get("web_search").expect("builtin");
        assert!(builtin.descriptor().index_worthy, "bare name is the built-in");
    }

    #[tokio::test]
    async fn test_remote_tool_forwards_auth() {
        let mut registry = ToolRegistry::new();
        register_server_tools(&mut registry, Arc::new(FakeServer), None)
            .await
            .expect("register");

        let tool = registry.get("ticket_create").expect("tool");
        let mut ctx = ToolContext::for_user(uuid::Uuid::new_v4(), uuid::Uuid::new_v4());

        // Without credentials the server demands auth.
        let err = tool.execute(json!({}), &ctx).await.expect_err("no auth");
        assert!(matches!(err, ToolError::AuthRequired(_)));

        ctx.auth = Some(b"Bearer xyz".to_vec());
        let value = tool.execute(json!({}), &ctx).await.expect("authed");
        assert_eq!(value["called"], "ticket_create");
    }

    #[tokio::test]
    async fn test_integration_credentials_used_as_fallback() {
        let mut registry = ToolRegistry::new();
        register_server_tools(
            &mut registry,
            Arc::new(FakeServer),
            Some(b"Bearer from-integration".to_vec()),
        )
        .await
        .expect("register");

        let tool = registry.get("ticket_create").expect("tool");
        let ctx = ToolContext::for_user(uuid::Uuid::new_v4(), uuid::Uuid::new_v4());

        // No per-call auth: the integration's blob is forwarded instead.
        let value = tool.execute(json!({}), &ctx).await.expect("authed");
        assert_eq!(value["called"], "ticket_create");
    }

    #[tokio::test]
    async fn test_remote_read_only_maps_side_effect() {
        let mut registry = ToolRegistry::new();
        register_server_tools(&mut registry, Arc::new(FakeServer), None)
            .await
            .expect("register");

        let search = registry.get("web_search").expect("search");
        assert_eq!(search.descriptor().side_effect, SideEffect::Read);
        let ticket = registry.get("ticket_create").expect("ticket");
        assert_eq!(ticket.descriptor().side_effect, SideEffect::External);
    }
}
