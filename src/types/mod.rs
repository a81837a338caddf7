//! Core entity types shared across the runtime.
//!
//! Persisted entities (tenant, user, session, message, notification,
//! integration, file) plus the in-memory exchange types (queue task, plan).
//! Every persisted entity carries a `tenant_id`; store queries always filter
//! by it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error raised when a stored enum column contains an unknown value.
#[derive(Debug, thiserror::Error)]
#[error("invalid {field} value: {value:?}")]
pub struct InvalidEnum {
    /// Which field contained the bad value.
    pub field: &'static str,
    /// The unexpected value.
    pub value: String,
}

// ---------------------------------------------------------------------------
// Tenancy
// ---------------------------------------------------------------------------

/// Top-level isolation boundary. Every other persisted entity references one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    /// Tenant identifier.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Storage namespace tag (also namespaces vector collections).
    pub schema_tag: String,
    /// Inactive tenants are excluded from background polling.
    pub active: bool,
}

/// Access role of a user within a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    /// Full administrative access.
    Admin,
    /// Standard interactive user.
    User,
    /// Read-only access.
    Viewer,
}

impl UserRole {
    /// String representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
            Self::Viewer => "viewer",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised role.
    pub fn parse(s: &str) -> Result<Self, InvalidEnum> {
        match s {
            "admin" => Ok(Self::Admin),
            "user" => Ok(Self::User),
            "viewer" => Ok(Self::Viewer),
            other => Err(InvalidEnum {
                field: "role",
                value: other.to_owned(),
            }),
        }
    }
}

/// A user account scoped to a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User identifier.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Email, unique within the tenant.
    pub email: String,
    /// Access role.
    pub role: UserRole,
    /// Deactivated users keep their data but cannot act.
    pub active: bool,
    /// Whether the email address has been verified.
    pub verified: bool,
}

// ---------------------------------------------------------------------------
// Sessions and messages
// ---------------------------------------------------------------------------

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Accepting new messages.
    Active,
    /// Soft-deleted: messages retained, no new requests accepted.
    Archived,
}

impl SessionStatus {
    /// String representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, InvalidEnum> {
        match s {
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            other => Err(InvalidEnum {
                field: "status",
                value: other.to_owned(),
            }),
        }
    }
}

/// A conversation session. Owns an ordered sequence of messages and at most
/// one pending plan (stored in `metadata` under [`Session::PLAN_KEY`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// Display title.
    pub title: String,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Free-form key/value bag; holds the pending plan, if any.
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Metadata key under which the pending plan is persisted.
    pub const PLAN_KEY: &'static str = "pending_plan";

    /// The pending plan stored in session metadata, if present and valid.
    pub fn pending_plan(&self) -> Option<Plan> {
        self.metadata
            .get(Self::PLAN_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Store a plan in session metadata, replacing any previous one.
    pub fn set_pending_plan(&mut self, plan: &Plan) {
        if let Ok(value) = serde_json::to_value(plan) {
            self.metadata.insert(Self::PLAN_KEY.to_owned(), value);
        }
    }

    /// Remove the pending plan from session metadata.
    pub fn clear_pending_plan(&mut self) {
        self.metadata.remove(Self::PLAN_KEY);
    }
}

/// Author role of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Human user message.
    User,
    /// Assistant response.
    Assistant,
    /// System message.
    System,
    /// Tool result.
    Tool,
}

impl MessageRole {
    /// String representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised role.
    pub fn parse(s: &str) -> Result<Self, InvalidEnum> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            "tool" => Ok(Self::Tool),
            other => Err(InvalidEnum {
                field: "role",
                value: other.to_owned(),
            }),
        }
    }
}

/// A message within a session. Append-only; insertion order is the only
/// ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message identifier.
    pub id: Uuid,
    /// Owning session.
    pub session_id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Author role.
    pub role: MessageRole,
    /// Text content.
    pub content: String,
    /// Structured tool calls attached to an assistant message, if any.
    pub tool_calls: Option<serde_json::Value>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build a new message with a fresh id and the current timestamp.
    pub fn new(session_id: Uuid, tenant_id: Uuid, role: MessageRole, content: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            tenant_id,
            role,
            content: content.to_owned(),
            tool_calls: None,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Notification and task priority, ordered lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Informational only.
    Info,
    /// Low urgency.
    Low,
    /// Default urgency.
    Medium,
    /// Needs prompt attention.
    High,
    /// Interrupts normal interaction.
    Critical,
}

impl Priority {
    /// String representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised priority.
    pub fn parse(s: &str) -> Result<Self, InvalidEnum> {
        match s {
            "info" => Ok(Self::Info),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(InvalidEnum {
                field: "priority",
                value: other.to_owned(),
            }),
        }
    }
}

/// Delivery channel for a notification, derived from its priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Halts normal interaction until resolved.
    Blocking,
    /// Pushed to the user immediately.
    Immediate,
    /// Delivered with the next response.
    Async,
    /// Batched into a periodic digest.
    Digest,
    /// Recorded only.
    Log,
}

impl Channel {
    /// Map a priority to its delivery channel.
    pub fn from_priority(priority: Priority) -> Self {
        match priority {
            Priority::Critical => Self::Blocking,
            Priority::High => Self::Immediate,
            Priority::Medium => Self::Async,
            Priority::Low => Self::Digest,
            Priority::Info => Self::Log,
        }
    }

    /// String representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocking => "blocking",
            Self::Immediate => "immediate",
            Self::Async => "async",
            Self::Digest => "digest",
            Self::Log => "log",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised channel.
    pub fn parse(s: &str) -> Result<Self, InvalidEnum> {
        match s {
            "blocking" => Ok(Self::Blocking),
            "immediate" => Ok(Self::Immediate),
            "async" => Ok(Self::Async),
            "digest" => Ok(Self::Digest),
            "log" => Ok(Self::Log),
            other => Err(InvalidEnum {
                field: "channel",
                value: other.to_owned(),
            }),
        }
    }
}

/// A user-facing notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Notification identifier.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// Originating session, if any.
    pub session_id: Option<Uuid>,
    /// Notification type (e.g. "email_received", "contradiction_detected").
    pub kind: String,
    /// Urgency.
    pub priority: Priority,
    /// Delivery channel, derived from priority at publish time.
    pub channel: Channel,
    /// Structured payload.
    pub payload: serde_json::Value,
    /// External reference for deduplication (e.g. email message id,
    /// calendar event id).
    pub reference_id: Option<String>,
    /// Whether the user has read it.
    pub read: bool,
    /// When it was resolved, for blocking notifications.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// Build a notification with a fresh id, channel derived from priority,
    /// and the current timestamp.
    pub fn new(
        tenant_id: Uuid,
        user_id: Uuid,
        kind: &str,
        priority: Priority,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            user_id,
            session_id: None,
            kind: kind.to_owned(),
            priority,
            channel: Channel::from_priority(priority),
            payload,
            reference_id: None,
            read: false,
            resolved_at: None,
            created_at: Utc::now(),
        }
    }

    /// Attach an external reference id used for deduplication.
    pub fn with_reference(mut self, reference_id: &str) -> Self {
        self.reference_id = Some(reference_id.to_owned());
        self
    }

    /// Attach an originating session.
    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

// ---------------------------------------------------------------------------
// Queue tasks
// ---------------------------------------------------------------------------

/// Lifecycle status of a queue task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the queue.
    Pending,
    /// Handed to a consumer.
    InFlight,
    /// Suspended pending user input.
    WaitingUser,
    /// Terminal: done.
    Completed,
    /// Terminal: gave up.
    Failed,
}

impl TaskStatus {
    /// Whether this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A unit of background work exchanged between agents via the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task identifier.
    pub id: Uuid,
    /// Urgency class; FIFO within each class.
    pub priority: Priority,
    /// Name of the agent that produced the task.
    pub origin_agent: String,
    /// Task type (e.g. "resolve_contradiction", "incoming_email").
    pub kind: String,
    /// Structured payload.
    pub payload: serde_json::Value,
    /// Current status.
    pub status: TaskStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Hidden from consumers until this instant, if set.
    pub visible_after: Option<DateTime<Utc>>,
}

impl Task {
    /// Build a pending task with a fresh id and the current timestamp.
    pub fn new(
        priority: Priority,
        origin_agent: &str,
        kind: &str,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            priority,
            origin_agent: origin_agent.to_owned(),
            kind: kind.to_owned(),
            payload,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            visible_after: None,
        }
    }

    /// Hide the task from consumers until the given instant.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.visible_after = Some(at);
        self
    }
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

/// Lifecycle status of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Executing steps.
    Running,
    /// Suspended at a wait step; resumed by the next matching user message.
    WaitingUser,
    /// Terminal: all steps ran.
    Completed,
    /// Terminal: a step errored.
    Failed,
}

/// A single plan step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanStep {
    /// Invoke a tool and attach its result.
    Tool {
        /// Registered tool name.
        tool_name: String,
        /// Arguments for the invocation.
        args: serde_json::Value,
        /// Result attached after execution.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
    },
    /// Format the final answer from accumulated results and terminate.
    Respond {
        /// Draft guidance for the response.
        draft: String,
    },
    /// Suspend and ask the user a question.
    WaitUser {
        /// The question to emit.
        question: String,
    },
}

/// Maximum number of steps a plan may carry; longer plans are truncated.
pub const MAX_PLAN_STEPS: usize = 5;

/// An ordered, resumable list of steps produced by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Plan identifier.
    pub id: Uuid,
    /// The user message that triggered planning.
    pub origin_message_id: Uuid,
    /// Ordered steps, at most [`MAX_PLAN_STEPS`].
    pub steps: Vec<PlanStep>,
    /// Index of the next step to execute.
    pub current_step_index: usize,
    /// Lifecycle status.
    pub status: PlanStatus,
    /// Set when the planner produced more steps than allowed and the tail
    /// was truncated.
    pub partial: bool,
}

impl Plan {
    /// Build a running plan from steps, truncating past [`MAX_PLAN_STEPS`].
    pub fn new(origin_message_id: Uuid, mut steps: Vec<PlanStep>) -> Self {
        let partial = steps.len() > MAX_PLAN_STEPS;
        steps.truncate(MAX_PLAN_STEPS);
        Self {
            id: Uuid::new_v4(),
            origin_message_id,
            steps,
            current_step_index: 0,
            status: PlanStatus::Running,
            partial,
        }
    }

    /// Whether the plan still has steps to run.
    pub fn has_remaining_steps(&self) -> bool {
        self.current_step_index < self.steps.len()
    }
}

// ---------------------------------------------------------------------------
// Integrations and files
// ---------------------------------------------------------------------------

/// External service an integration connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// Calendar provider.
    Calendar,
    /// Email provider.
    Email,
    /// External tool server.
    ToolServer,
}

impl ServiceKind {
    /// String representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Calendar => "calendar",
            Self::Email => "email",
            Self::ToolServer => "tool_server",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised service kind.
    pub fn parse(s: &str) -> Result<Self, InvalidEnum> {
        match s {
            "calendar" => Ok(Self::Calendar),
            "email" => Ok(Self::Email),
            "tool_server" => Ok(Self::ToolServer),
            other => Err(InvalidEnum {
                field: "service",
                value: other.to_owned(),
            }),
        }
    }
}

/// A user-scoped connection to an external service. Credentials are opaque
/// encrypted bytes; the core hands them to collaborators and never inspects
/// or retains them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Integration {
    /// Integration identifier.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// Which service this connects to.
    pub service: ServiceKind,
    /// Disabled integrations are skipped by pollers and the tool registry.
    pub enabled: bool,
    /// Opaque encrypted credential blob.
    #[serde(skip_serializing)]
    pub encrypted_credentials: Vec<u8>,
    /// Service-specific metadata (server URL, account hints).
    pub metadata: serde_json::Value,
}

/// A stored file reference. `session_id` is nullable so a file outlives any
/// session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// File identifier.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// Session the file was uploaded in, if any.
    pub session_id: Option<Uuid>,
    /// Original file name.
    pub name: String,
    /// MIME type.
    pub mime: String,
    /// Opaque storage reference resolved by the file collaborator.
    pub storage_ref: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}
