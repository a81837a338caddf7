//! Tool descriptors, registry and error kinds.
//!
//! Each tool declares what it does, when to use it, its argument schema
//! and its side-effect level. The registry is assembled at startup from
//! built-in tools, enabled user integrations, and tools discovered from
//! external tool servers (see [`remote`]). Invocation mechanics (schema
//! validation, timeouts, retry, auto-indexing) live in [`invoker`].

pub mod builtin;
pub mod invoker;
pub mod remote;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::providers::ToolSpec;

/// Side-effect level of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SideEffect {
    /// No observable effect.
    Pure,
    /// Reads external state.
    Read,
    /// Mutates external state.
    Write,
    /// Calls out to an external system with unknown effects.
    External,
}

/// Static description of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Registered name.
    pub name: String,
    /// What the tool does.
    pub what: String,
    /// When the planner should reach for it.
    pub when_to_use: String,
    /// JSON Schema object for the arguments.
    pub args_schema: serde_json::Value,
    /// Side-effect level.
    pub side_effect: SideEffect,
    /// Whether successful results are auto-indexed into long-term memory.
    pub index_worthy: bool,
    /// Per-tool timeout override, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl ToolDescriptor {
    /// Shape the descriptor for an LLM tool list.
    pub fn to_spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: format!("{} Use when: {}", self.what, self.when_to_use),
            input_schema: self.args_schema.clone(),
        }
    }
}

/// Per-invocation context handed to tools.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Invoking user.
    pub user_id: Uuid,
    /// Originating session, if any.
    pub session_id: Option<Uuid>,
    /// Opaque bearer bytes for tools that call external servers. Never
    /// inspected or retained by the core.
    pub auth: Option<Vec<u8>>,
}

impl ToolContext {
    /// Context without session or credentials.
    pub fn for_user(tenant_id: Uuid, user_id: Uuid) -> Self {
        Self {
            tenant_id,
            user_id,
            session_id: None,
            auth: None,
        }
    }
}

/// Errors surfaced by tool execution.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// Arguments failed schema validation. Never retried.
    #[error("bad arguments: {0}")]
    BadArgs(String),

    /// No tool with that name is registered.
    #[error("tool not found: {0}")]
    NotFound(String),

    /// The call exceeded its deadline.
    #[error("tool timed out after {0}s")]
    Timeout(u64),

    /// The upstream service failed transiently.
    #[error("upstream unavailable: {0}")]
    Upstream(String),

    /// The integration's credentials are invalid or expired. Never
    /// retried; surfaced as a re-auth notification.
    #[error("authentication required: {0}")]
    AuthRequired(String),

    /// Unexpected internal failure.
    #[error("internal tool failure: {0}")]
    Internal(String),
}

impl ToolError {
    /// Stable kind tag for structured results.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadArgs(_) => "bad_args",
            Self::NotFound(_) => "not_found",
            Self::Timeout(_) => "transport_timeout",
            Self::Upstream(_) => "upstream_unavailable",
            Self::AuthRequired(_) => "auth_required",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether a retry with the same arguments may succeed.
    pub fn retriable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Upstream(_))
    }
}

/// A callable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Static description.
    fn descriptor(&self) -> ToolDescriptor;

    /// Execute with validated arguments.
    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError>;
}

/// Registry of callable tools, keyed by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("count", &self.tools.len())
            .finish()
    }
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Returns `false` (and keeps the existing entry)
    /// when the name is already taken — built-ins are registered first, so
    /// they win over later tool-server discoveries.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> bool {
        let name = tool.descriptor().name;
        if self.tools.contains_key(&name) {
            return false;
        }
        self.tools.insert(name, tool);
        true
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Whether a name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// All descriptors, sorted by name for stable prompts.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut all: Vec<ToolDescriptor> =
            self.tools.values().map(|t| t.descriptor()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// All tool specs for an LLM call.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.descriptors().iter().map(ToolDescriptor::to_spec).collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Validate arguments against a tool's JSON Schema object.
///
/// Checks that `args` is an object, that every required property is
/// present, that no unknown properties appear, and that declared
/// primitive types match.
///
/// # Errors
///
/// Returns [`ToolError::BadArgs`] describing the first violation.
pub fn validate_args(schema: &serde_json::Value, args: &serde_json::Value) -> Result<(), ToolError> {
    let args_obj = args
        .as_object()
        .ok_or_else(|| ToolError::BadArgs("arguments must be a JSON object".to_owned()))?;

    let properties = schema
        .get("properties")
        .and_then(|p| p.as_object())
        .cloned()
        .unwrap_or_default();

    // Unknown fields are rejected outright.
    for key in args_obj.keys() {
        if !properties.contains_key(key) {
            return Err(ToolError::BadArgs(format!("unknown field {key:?}")));
        }
    }

    // Required fields must be present.
    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for name in required.iter().filter_map(|v| v.as_str()) {
            if !args_obj.contains_key(name) {
                return Err(ToolError::BadArgs(format!("missing required field {name:?}")));
            }
        }
    }

    // Shallow type check on declared primitives.
    for (key, value) in args_obj {
        let declared = properties
            .get(key)
            .and_then(|p| p.get("type"))
            .and_then(|t| t.as_str());
        let matches = match declared {
            Some("string") => value.is_string(),
            Some("integer") => value.is_i64() || value.is_u64(),
            Some("number") => value.is_number(),
            Some("boolean") => value.is_boolean(),
            Some("array") => value.is_array(),
            Some("object") => value.is_object(),
            _ => true,
        };
        if !matches {
            return Err(ToolError::BadArgs(format!(
                "field {key:?} should be of type {}",
                declared.unwrap_or("unknown")
            )));
        }
    }

    Ok(())
}
