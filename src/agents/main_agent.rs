//! Main agent node: the only producer of user-visible text.
//!
//! Consumes the plan, retrieved memories and tool results and emits the
//! assistant draft. A suspended plan's question is emitted verbatim; an
//! empty user message gets a prompt for input without touching memory; a
//! safety-blocked model yields a neutral fallback; any other model
//! failure yields the fixed apology.

use std::sync::Arc;

use tracing::{error, warn};

use crate::kernel::graph::{GraphCtx, Node, APOLOGY_MESSAGE};
use crate::kernel::state::RequestState;
use crate::providers::{LanguageModel, LlmRequest, PromptMessage, ProviderError};
use crate::types::{Notification, PlanStatus, PlanStep, Priority};

/// Reply to an empty user message.
const EMPTY_MESSAGE_REPLY: &str =
    "I didn't receive any text — what would you like me to help with?";

/// Reply when the provider's safety layer blocks the output.
const SAFETY_FALLBACK: &str =
    "I can't help with that request. Is there something else I can do for you?";

/// System prompt for the response model.
const MAIN_SYSTEM_PROMPT: &str = "\
You are the assistant's response stage. Compose the reply to the user from \
the conversation, the retrieved memories, and the tool results provided. \
Be concise and concrete. If some tool steps failed, say what worked and \
what did not instead of pretending completeness.";

/// The response-producing node.
pub struct MainAgentNode {
    model: Arc<dyn LanguageModel>,
}

impl MainAgentNode {
    /// Create the node over the response model.
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    fn compose_request(state: &RequestState) -> LlmRequest {
        let mut sections = String::new();

        if !state.memories.is_empty() {
            sections.push_str("## Relevant memories\n");
            for hit in &state.memories {
                sections.push_str("- ");
                sections.push_str(&hit.content);
                sections.push('\n');
            }
            sections.push('\n');
        }

        if let Some(plan) = &state.plan {
            if plan.partial {
                sections.push_str(
                    "## Note\nThe plan was truncated to the step limit; mention that some \
                     requested work was left out.\n\n",
                );
            }
            if plan.status == PlanStatus::Failed {
                sections.push_str(
                    "## Note\nA plan step failed. Summarise what succeeded and what did not.\n\n",
                );
            }
            for step in &plan.steps {
                if let PlanStep::Respond { draft } = step {
                    sections.push_str("## Response guidance\n");
                    sections.push_str(draft);
                    sections.push_str("\n\n");
                }
            }
        }

        if !state.tool_records.is_empty() {
            sections.push_str("## Tool results\n");
            for record in &state.tool_records {
                match &record.result {
                    Ok(value) => {
                        sections.push_str(&format!("- {} → {}\n", record.tool_name, value));
                    }
                    Err(failure) => {
                        sections.push_str(&format!(
                            "- {} FAILED ({}): {}\n",
                            record.tool_name, failure.kind, failure.message
                        ));
                    }
                }
            }
            sections.push('\n');
        }

        let mut messages: Vec<PromptMessage> = state
            .short_history
            .iter()
            .map(|m| PromptMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect();
        messages.push(PromptMessage::user(&format!(
            "{sections}## User message\n{}",
            state.message.content
        )));

        LlmRequest::text(MAIN_SYSTEM_PROMPT, messages)
    }
}

#[async_trait::async_trait]
impl Node for MainAgentNode {
    fn name(&self) -> &'static str {
        "main_agent"
    }

    async fn run(&self, mut state: RequestState, _ctx: &GraphCtx) -> RequestState {
        // A suspended plan speaks its question; no model call needed.
        if let Some(question) = state.pending_question.clone() {
            state.assistant_draft = Some(question);
            return state;
        }

        // Empty input: prompt for text, write nothing.
        if state.message.content.trim().is_empty() {
            state.assistant_draft = Some(EMPTY_MESSAGE_REPLY.to_owned());
            return state;
        }

        let request = Self::compose_request(&state);
        match self.model.generate(request).await {
            Ok(response) => {
                state.assistant_draft = Some(response.text);
            }
            Err(ProviderError::SafetyBlocked) => {
                warn!("main agent output safety-blocked; using neutral fallback");
                state.assistant_draft = Some(SAFETY_FALLBACK.to_owned());
            }
            Err(err) => {
                error!(error = %err, "main agent model call failed");
                state.assistant_draft = Some(APOLOGY_MESSAGE.to_owned());
            }
        }

        // Surface plan anomalies to the user's notification feed.
        if let Some(plan) = &state.plan {
            let plan_id = plan.id;
            let plan_partial = plan.partial;
            let plan_failed = plan.status == PlanStatus::Failed;
            if plan_partial {
                let n = Notification::new(
                    state.tenant_id,
                    state.user_id,
                    "plan_truncated",
                    Priority::Info,
                    serde_json::json!({ "plan_id": plan_id }),
                )
                .with_session(state.session_id);
                state.buffer_notification(n);
            }
            if plan_failed {
                let n = Notification::new(
                    state.tenant_id,
                    state.user_id,
                    "plan_failed",
                    Priority::Medium,
                    serde_json::json!({ "plan_id": plan_id }),
                )
                .with_session(state.session_id);
                state.buffer_notification(n);
            }
        }

        state
    }
}
