//! The orchestration kernel.
//!
//! [`Kernel::handle_message`] is the request entry point: it serialises
//! per-session access, persists the user turn, dispatches background
//! knowledge work on an immutable snapshot, runs the agent graph, and
//! persists the outcome (assistant message, plan state). Background tasks
//! from the queue are routed through [`Kernel::handle_task`].

pub mod graph;
pub mod planner;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agents::KnowledgeAgent;
use crate::memory::MemoryManager;
use crate::notify::NotificationCenter;
use crate::session::SessionRegistry;
use crate::store::Store;
use crate::types::{
    Message, MessageRole, Notification, PlanStatus, Priority, SessionStatus, Task, TaskStatus,
};

use self::graph::{Graph, GraphCtx, APOLOGY_MESSAGE};
use self::state::{NotificationSummary, RequestState};

/// The assembled kernel.
pub struct Kernel {
    store: Arc<Store>,
    memory: Arc<MemoryManager>,
    sessions: Arc<SessionRegistry>,
    notify: Arc<NotificationCenter>,
    knowledge: Arc<KnowledgeAgent>,
    graph: Graph,
    ctx: GraphCtx,
    request_timeout: Duration,
}

/// What the transport receives for a handled message.
#[derive(Debug, Clone)]
pub struct KernelResponse {
    /// Session the response belongs to.
    pub session_id: Uuid,
    /// Assistant text.
    pub text: String,
    /// Status of the plan after this request, if one was involved.
    pub plan_status: Option<PlanStatus>,
    /// Whether memory retrieval was degraded.
    pub memory_degraded: bool,
    /// Notification summary attached by the collector.
    pub notifications: NotificationSummary,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel").finish_non_exhaustive()
    }
}

impl Kernel {
    /// Assemble the kernel from its services.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        memory: Arc<MemoryManager>,
        sessions: Arc<SessionRegistry>,
        notify: Arc<NotificationCenter>,
        knowledge: Arc<KnowledgeAgent>,
        graph: Graph,
        ctx: GraphCtx,
        request_timeout: Duration,
    ) -> Self {
        Self {
            store,
            memory,
            sessions,
            notify,
            knowledge,
            graph,
            ctx,
            request_timeout,
        }
    }

    /// Handle one user message end to end.
    ///
    /// Requests on the same session are serialised; the graph runs under
    /// the end-to-end deadline; background knowledge work is dispatched on
    /// a snapshot and never awaited.
    ///
    /// # Errors
    ///
    /// Returns an error when the session does not exist, is archived, or
    /// persistence fails. Model and tool failures degrade inside the
    /// graph instead of erroring here.
    pub async fn handle_message(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        text: &str,
        force_web_search: bool,
    ) -> anyhow::Result<KernelResponse> {
        let entry = self.sessions.entry(session_id).await;
        let _request_guard = entry.lock_request().await;

        let session = self
            .store
            .get_session(tenant_id, session_id)
            .await?
            .with_context(|| format!("session {session_id} not found"))?;
        anyhow::ensure!(
            session.status == SessionStatus::Active,
            "session {session_id} is archived"
        );

        // Persist and remember the user turn.
        let message = Message::new(session_id, tenant_id, MessageRole::User, text);
        if !text.trim().is_empty() {
            self.store.append_message(message.clone()).await?;
            self.memory.record_message(session_id, message.clone()).await;
        }

        let mut request = RequestState::new(session, message);
        request.force_web_search = force_web_search;

        // Detached knowledge pass over the immutable snapshot. It writes
        // only into the append-only stores and never delays the response.
        if !text.trim().is_empty() {
            let snapshot = request.snapshot();
            let knowledge = self.knowledge.clone();
            let _handle = self.ctx.workers.spawn("knowledge_extraction", async move {
                knowledge.process(snapshot).await;
            });
        }

        // Run the graph under the end-to-end deadline.
        let state = match tokio::time::timeout(
            self.request_timeout,
            self.graph.run(request, &self.ctx),
        )
        .await
        {
            Ok(state) => state,
            Err(_) => {
                warn!(session = %session_id, "request deadline exceeded");
                let session = self
                    .store
                    .get_session(tenant_id, session_id)
                    .await?
                    .with_context(|| format!("session {session_id} vanished"))?;
                let message = Message::new(session_id, tenant_id, MessageRole::User, text);
                let mut state = RequestState::new(session, message);
                state.assistant_draft = Some(APOLOGY_MESSAGE.to_owned());
                state
            }
        };

        self.persist_outcome(&state).await?;

        Ok(KernelResponse {
            session_id,
            text: state
                .assistant_draft
                .clone()
                .unwrap_or_else(|| APOLOGY_MESSAGE.to_owned()),
            plan_status: state.plan.as_ref().map(|p| p.status),
            memory_degraded: state.memory_degraded,
            notifications: state.notification_summary.clone().unwrap_or_default(),
        })
    }

    /// Persist the assistant turn and the plan state.
    async fn persist_outcome(&self, state: &RequestState) -> anyhow::Result<()> {
        // Plan suspension and completion both live in session metadata so
        // they survive across requests and restarts.
        let mut session = state.session.clone();
        let metadata_changed = match &state.plan {
            Some(plan) if plan.status == PlanStatus::WaitingUser => {
                session.set_pending_plan(plan);
                true
            }
            Some(_) => {
                let had = session.pending_plan().is_some();
                session.clear_pending_plan();
                had
            }
            None => false,
        };
        if metadata_changed {
            self.store
                .update_session_metadata(state.tenant_id, state.session_id, &session.metadata)
                .await?;
        }

        if let Some(draft) = &state.assistant_draft {
            let reply = Message::new(
                state.session_id,
                state.tenant_id,
                MessageRole::Assistant,
                draft,
            );
            self.store.append_message(reply.clone()).await?;
            self.memory.record_message(state.session_id, reply).await;
        }

        Ok(())
    }

    /// Route a background task taken from the queue.
    ///
    /// `notify_user` tasks (from the pollers) become published
    /// notifications; `resolve_contradiction` tasks were already
    /// announced by the integrity checker and just need closing.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure; unknown task kinds fail the
    /// task without erroring.
    pub async fn handle_task(&self, task: &Task) -> anyhow::Result<TaskStatus> {
        match task.kind.as_str() {
            "notify_user" => {
                let notification = notification_from_task(task)
                    .context("notify_user task with malformed payload")?;
                self.notify.publish(notification).await?;
                Ok(TaskStatus::Completed)
            }
            "resolve_contradiction" => {
                // The blocking notification carrying the resolution form
                // is already out; the queue entry is just the work marker.
                info!(task_id = %task.id, "contradiction resolution handed to the user");
                Ok(TaskStatus::Completed)
            }
            other => {
                warn!(task_id = %task.id, kind = other, "unknown task kind");
                Ok(TaskStatus::Failed)
            }
        }
    }

    /// Incremental history read for a session, starting after `cursor`.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn history_since(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        cursor: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<crate::store::sessions::StoredMessage>> {
        let messages = self
            .store
            .list_messages(tenant_id, session_id, cursor, limit)
            .await?;
        if let Some(last) = messages.last() {
            self.sessions.entry(session_id).await.advance_cursor(last.seq);
        }
        Ok(messages)
    }
}

/// Build a [`Notification`] from a poller task payload.
fn notification_from_task(task: &Task) -> Option<Notification> {
    let payload = task.payload.as_object()?;
    let tenant_id = payload.get("tenant_id")?.as_str()?.parse().ok()?;
    let user_id = payload.get("user_id")?.as_str()?.parse().ok()?;
    let kind = payload.get("kind")?.as_str()?;
    let priority = payload
        .get("priority")
        .and_then(|p| p.as_str())
        .and_then(|p| Priority::parse(p).ok())
        .unwrap_or(task.priority);
    let body = payload
        .get("payload")
        .cloned()
        .unwrap_or(serde_json::Value::Null);

    let mut notification = Notification::new(tenant_id, user_id, kind, priority, body);
    if let Some(reference) = payload.get("reference_id").and_then(|r| r.as_str()) {
        notification = notification.with_reference(reference);
    }
    if let Some(session) = payload
        .get("session_id")
        .and_then(|s| s.as_str())
        .and_then(|s| s.parse().ok())
    {
        notification = notification.with_session(session);
    }
    Some(notification)
}

/// Helper building the payload for a `notify_user` task, the inverse of
/// [`notification_from_task`]. Used by the pollers.
pub fn notify_user_payload(
    tenant_id: Uuid,
    user_id: Uuid,
    kind: &str,
    priority: Priority,
    reference_id: Option<&str>,
    payload: serde_json::Value,
) -> serde_json::Value {
    serde_json::json!({
        "tenant_id": tenant_id.to_string(),
        "user_id": user_id.to_string(),
        "kind": kind,
        "priority": priority.as_str(),
        "reference_id": reference_id,
        "payload": payload,
    })
}
