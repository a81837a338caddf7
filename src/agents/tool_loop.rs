//! Tool loop node: executes plan steps in order.
//!
//! `Tool` steps invoke the registry and attach their results to the step;
//! `WaitUser` suspends the plan and ends the loop; `Respond` hands over to
//! the main agent. A failed tool invocation marks the plan failed — the
//! main agent still summarises what succeeded and what did not.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::kernel::graph::{GraphCtx, Node};
use crate::kernel::state::RequestState;
use crate::tools::invoker::ToolInvoker;
use crate::tools::ToolContext;
use crate::types::{Notification, PlanStatus, PlanStep, Priority};

/// Executes the active plan's steps on the critical path.
pub struct ToolLoopNode {
    invoker: Arc<ToolInvoker>,
}

impl ToolLoopNode {
    /// Create the node over the invoker.
    pub fn new(invoker: Arc<ToolInvoker>) -> Self {
        Self { invoker }
    }
}

#[async_trait::async_trait]
impl Node for ToolLoopNode {
    fn name(&self) -> &'static str {
        "tool_loop"
    }

    async fn run(&self, mut state: RequestState, _ctx: &GraphCtx) -> RequestState {
        let Some(mut plan) = state.plan.take() else {
            return state;
        };

        let tool_ctx = ToolContext {
            tenant_id: state.tenant_id,
            user_id: state.user_id,
            session_id: Some(state.session_id),
            auth: None,
        };

        while plan.status == PlanStatus::Running && plan.has_remaining_steps() {
            let index = plan.current_step_index;
            match plan.steps.get_mut(index) {
                Some(PlanStep::Tool {
                    tool_name,
                    args,
                    result,
                }) => {
                    debug!(step = index, tool = %tool_name, "executing plan step");
                    let record = self
                        .invoker
                        .invoke(tool_name, args.clone(), &tool_ctx)
                        .await;
                    if let Ok(value) = &record.result {
                        *result = Some(value.clone());
                    }
                    let failed = !record.is_ok();
                    // Expired credentials get a re-auth notification so
                    // the user can fix the integration.
                    if let Err(failure) = &record.result {
                        if failure.kind == "auth_required" {
                            let n = Notification::new(
                                state.tenant_id,
                                state.user_id,
                                "reauth_required",
                                Priority::High,
                                serde_json::json!({
                                    "tool": record.tool_name,
                                    "message": failure.message,
                                }),
                            )
                            .with_session(state.session_id)
                            .with_reference(&record.tool_name);
                            state.buffer_notification(n);
                        }
                    }
                    state.tool_records.push(record);
                    if failed {
                        warn!(step = index, "plan step failed; plan marked failed");
                        plan.status = PlanStatus::Failed;
                        break;
                    }
                    plan.current_step_index = index.saturating_add(1);
                }
                Some(PlanStep::WaitUser { question }) => {
                    state.pending_question = Some(question.clone());
                    plan.status = PlanStatus::WaitingUser;
                    // The next user message resumes at the following step.
                    plan.current_step_index = index.saturating_add(1);
                    break;
                }
                Some(PlanStep::Respond { .. }) => {
                    // The main agent consumes the draft; the plan is done
                    // from the loop's point of view.
                    plan.current_step_index = index.saturating_add(1);
                    plan.status = PlanStatus::Completed;
                    break;
                }
                None => break,
            }
        }

        if plan.status == PlanStatus::Running && !plan.has_remaining_steps() {
            plan.status = PlanStatus::Completed;
        }

        state.plan = Some(plan);
        state
    }
}
