//! Shared request state flowing through the agent graph.
//!
//! Nodes are pure transformations `state -> state`; the executor clones
//! the state at node boundaries, and background tasks receive an
//! immutable [`StateSnapshot`] taken at spawn time, so they never observe
//! later mutations.

use std::sync::Arc;

use uuid::Uuid;

use crate::memory::MemoryHit;
use crate::tools::invoker::InvokeRecord;
use crate::types::{Message, Notification, Plan, Session};

/// An immutable snapshot of the request state for background tasks.
pub type StateSnapshot = Arc<RequestState>;

/// State record shared by all agent nodes of one request.
#[derive(Debug, Clone)]
pub struct RequestState {
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Requesting user.
    pub user_id: Uuid,
    /// Session the request belongs to.
    pub session_id: Uuid,
    /// The incoming user message.
    pub message: Message,
    /// Session snapshot loaded at request start.
    pub session: Session,
    /// Short-term conversation window, oldest first.
    pub short_history: Vec<Message>,
    /// Memories retrieved for context.
    pub memories: Vec<MemoryHit>,
    /// Set when memory retrieval ran keyword-only.
    pub memory_degraded: bool,
    /// Caller's request to force a web search step.
    pub force_web_search: bool,
    /// The active plan, if the planner produced or resumed one.
    pub plan: Option<Plan>,
    /// Whether the plan was resumed from a suspended state.
    pub resumed: bool,
    /// Question emitted by a wait step, ending the request early.
    pub pending_question: Option<String>,
    /// Results of tool invocations made by the tool loop.
    pub tool_records: Vec<InvokeRecord>,
    /// Notification buffer drained by the collector node.
    pub notifications: Vec<Notification>,
    /// Summary attached by the collector node.
    pub notification_summary: Option<NotificationSummary>,
    /// The response under construction.
    pub assistant_draft: Option<String>,
}

/// What the notification collector attaches to the response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationSummary {
    /// Total notifications produced by this request.
    pub total: usize,
    /// Notifications of high or critical priority, surfaced inline.
    pub high_priority: Vec<Notification>,
}

impl RequestState {
    /// Build the initial state for a request.
    pub fn new(session: Session, message: Message) -> Self {
        Self {
            tenant_id: session.tenant_id,
            user_id: session.user_id,
            session_id: session.id,
            message,
            session,
            short_history: Vec::new(),
            memories: Vec::new(),
            memory_degraded: false,
            force_web_search: false,
            plan: None,
            resumed: false,
            pending_question: None,
            tool_records: Vec::new(),
            notifications: Vec::new(),
            notification_summary: None,
            assistant_draft: None,
        }
    }

    /// Take an immutable snapshot for background tasks.
    pub fn snapshot(&self) -> StateSnapshot {
        Arc::new(self.clone())
    }

    /// Push a notification into the per-request buffer.
    pub fn buffer_notification(&mut self, notification: Notification) {
        self.notifications.push(notification);
    }

    /// Successful tool result values, in invocation order.
    pub fn tool_values(&self) -> Vec<&serde_json::Value> {
        self.tool_records
            .iter()
            .filter_map(|r| r.result.as_ref().ok())
            .collect()
    }

    /// Whether any tool invocation failed.
    pub fn any_tool_failed(&self) -> bool {
        self.tool_records.iter().any(|r| !r.is_ok())
    }
}
