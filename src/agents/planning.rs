//! Planning node: wraps the planner and applies its failure policy.

use std::sync::Arc;

use tracing::warn;

use crate::kernel::graph::{GraphCtx, Node};
use crate::kernel::planner::{Planner, PlannerDecision};
use crate::kernel::state::RequestState;
use crate::providers::PromptMessage;
use crate::tools::ToolRegistry;
use crate::types::{Plan, PlanStep};

/// Runs the planner over the incoming message. Planner failures fall back
/// to "no plan" so the main agent can still answer conversationally.
pub struct PlanNode {
    planner: Arc<Planner>,
    registry: Arc<ToolRegistry>,
}

impl PlanNode {
    /// Create the node.
    pub fn new(planner: Arc<Planner>, registry: Arc<ToolRegistry>) -> Self {
        Self { planner, registry }
    }
}

#[async_trait::async_trait]
impl Node for PlanNode {
    fn name(&self) -> &'static str {
        "planner"
    }

    async fn run(&self, mut state: RequestState, _ctx: &GraphCtx) -> RequestState {
        let text = state.message.content.clone();
        state.force_web_search =
            Planner::effective_force_web_search(&text, state.force_web_search);

        let pending = state.session.pending_plan();
        let context: Vec<PromptMessage> = state
            .short_history
            .iter()
            .map(|m| PromptMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect();
        let descriptors = self.registry.descriptors();

        let decision = match self
            .planner
            .decide(state.message.id, &text, pending.as_ref(), &descriptors, &context)
            .await
        {
            Ok(decision) => decision,
            Err(err) => {
                warn!(error = %err, "planner failed; answering without a plan");
                PlannerDecision::NoPlan
            }
        };

        match decision {
            PlannerDecision::NoPlan => {
                // A surviving force flag still gets its search, as a
                // one-step plan.
                if state.force_web_search && self.registry.contains("web_search") {
                    state.plan = Some(Plan::new(
                        state.message.id,
                        vec![PlanStep::Tool {
                            tool_name: "web_search".to_owned(),
                            args: serde_json::json!({ "query": text }),
                            result: None,
                        }],
                    ));
                }
            }
            PlannerDecision::Resume(plan) => {
                state.plan = Some(plan);
                state.resumed = true;
            }
            PlannerDecision::NewPlan(plan) => {
                state.plan = Some(plan);
            }
        }

        state
    }
}
