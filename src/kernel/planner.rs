//! Planner: classify the user message, produce or resume a plan.
//!
//! Classification order:
//! 1. A short affirmative while the session holds a `waiting_user` plan
//!    resumes that plan — no new plan is created.
//! 2. Plain chat with no tool need yields no plan.
//! 3. Otherwise the planner model produces a plan of at most
//!    [`MAX_PLAN_STEPS`](crate::types::MAX_PLAN_STEPS) steps.
//!
//! The caller's `force_web_search` flag is overridden to `false` for
//! acknowledgements and for short messages without web-intent keywords.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::providers::{LanguageModel, LlmRequest, PromptMessage, ProviderError};
use crate::tools::ToolDescriptor;
use crate::types::{Plan, PlanStatus, PlanStep};

/// Messages shorter than this are acknowledgement / override candidates.
const SHORT_MESSAGE_CHARS: usize = 15;

/// Affirmative turns across the languages the assistant speaks.
const AFFIRMATIVES: &[&str] = &[
    "yes", "y", "yeah", "yep", "sure", "ok", "okay", "go ahead", "do it", "proceed", "please do",
    "sounds good", "si", "sì", "sí", "sì grazie", "si grazie", "va bene", "certo", "d'accordo",
    "oui", "d'accord", "ja", "klar", "da", "claro", "vale",
];

/// Tokens signalling genuine web intent in a short message.
const WEB_INTENT_KEYWORDS: &[&str] = &[
    "search", "google", "web", "news", "latest", "lookup", "look up", "find", "cerca", "busca",
    "cherche",
];

/// Planner system prompt. The model answers with a JSON plan or an empty
/// step list for plain chat.
const PLANNER_SYSTEM_PROMPT: &str = "\
You are the planning stage of an assistant runtime. Decide whether the \
user's message needs tools, and if so produce a short execution plan.

Rules:
- Use only tools from the provided list.
- At most 5 steps.
- Step kinds: {\"type\":\"tool\",\"tool_name\":...,\"args\":{...}}, \
{\"type\":\"wait_user\",\"question\":...}, {\"type\":\"respond\",\"draft\":...}.
- Plain conversation needs no tools: answer {\"steps\":[]}.
- Insert a wait_user step before irreversible or costly actions.

Answer ONLY with JSON: {\"steps\":[...]}";

/// What the planner decided for this message.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerDecision {
    /// Plain chat; the main agent answers directly.
    NoPlan,
    /// Resume the session's suspended plan at its next step.
    Resume(Plan),
    /// Execute a freshly produced plan.
    NewPlan(Plan),
}

/// Planner errors. The planner node degrades every error to
/// [`PlannerDecision::NoPlan`]; the type exists so tests can assert causes.
#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    /// The model call failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// The model response held no parsable plan.
    #[error("unparsable plan: {0}")]
    Unparsable(String),
    /// The plan referenced a tool that is not registered.
    #[error("plan references unknown tool {0:?}")]
    UnknownTool(String),
}

/// JSON shape expected from the planner model.
#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    steps: Vec<PlanStep>,
}

/// The planner service.
pub struct Planner {
    model: Arc<dyn LanguageModel>,
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner")
            .field("model", &self.model.model_id())
            .finish()
    }
}

impl Planner {
    /// Create a planner over the given model.
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Classify a message and produce the planner decision.
    ///
    /// `pending` is the session's suspended plan, if any.
    ///
    /// # Errors
    ///
    /// Returns an error when plan production fails; acknowledgement
    /// resume and plain chat never fail.
    pub async fn decide(
        &self,
        message_id: Uuid,
        text: &str,
        pending: Option<&Plan>,
        tools: &[ToolDescriptor],
        context: &[PromptMessage],
    ) -> Result<PlannerDecision, PlannerError> {
        // Rule 1: acknowledgement resumes a suspended plan.
        if let Some(plan) = pending {
            if plan.status == PlanStatus::WaitingUser && is_acknowledgement(text) {
                debug!(plan_id = %plan.id, "acknowledgement resumes suspended plan");
                let mut resumed = plan.clone();
                resumed.status = PlanStatus::Running;
                return Ok(PlannerDecision::Resume(resumed));
            }
        }

        // Rule 2/3: ask the planner model. An empty message is plain chat.
        if text.trim().is_empty() {
            return Ok(PlannerDecision::NoPlan);
        }

        let request = self.compose_request(text, tools, context);
        let response = self.model.generate(request).await?;
        let steps = parse_steps(&response.text)?;

        if steps.is_empty() {
            return Ok(PlannerDecision::NoPlan);
        }
        validate_steps(&steps, tools)?;

        Ok(PlannerDecision::NewPlan(Plan::new(message_id, steps)))
    }

    /// Apply the short-message override to the caller's `force_web_search`
    /// flag: acknowledgements and short messages without web-intent
    /// keywords never force a search.
    pub fn effective_force_web_search(text: &str, requested: bool) -> bool {
        if !requested {
            return false;
        }
        if is_acknowledgement(text) {
            return false;
        }
        if text.chars().count() < SHORT_MESSAGE_CHARS && !has_web_intent(text) {
            return false;
        }
        true
    }

    fn compose_request(
        &self,
        text: &str,
        tools: &[ToolDescriptor],
        context: &[PromptMessage],
    ) -> LlmRequest {
        let tools_json = serde_json::to_string_pretty(
            &tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name,
                        "what": t.what,
                        "when_to_use": t.when_to_use,
                        "args_schema": t.args_schema,
                    })
                })
                .collect::<Vec<_>>(),
        )
        .unwrap_or_else(|_| "[]".to_owned());

        let mut messages = context.to_vec();
        messages.push(PromptMessage::user(&format!(
            "## Available tools\n{tools_json}\n\n## User message\n{text}"
        )));

        LlmRequest::text(PLANNER_SYSTEM_PROMPT, messages)
    }
}

/// Whether a short user turn is an affirmative acknowledgement.
pub fn is_acknowledgement(text: &str) -> bool {
    let normalised = normalise_turn(text);
    if normalised.is_empty() || text.trim().chars().count() >= SHORT_MESSAGE_CHARS {
        return false;
    }
    AFFIRMATIVES.contains(&normalised.as_str())
}

/// Whether the text carries any web-intent keyword.
fn has_web_intent(text: &str) -> bool {
    let lower = text.to_lowercase();
    WEB_INTENT_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Lower-case, trim, and strip punctuation so "Sì, grazie!" matches
/// "sì grazie".
fn normalise_turn(text: &str) -> String {
    let lower = text.trim().to_lowercase();
    let cleaned: String = lower
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '\'')
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse plan steps from a model response: direct JSON first, then a
/// fenced code block.
fn parse_steps(response: &str) -> Result<Vec<PlanStep>, PlannerError> {
    let trimmed = response.trim();

    if let Ok(raw) = serde_json::from_str::<RawPlan>(trimmed) {
        return Ok(raw.steps);
    }
    if let Some(block) = fenced_json(trimmed) {
        if let Ok(raw) = serde_json::from_str::<RawPlan>(block) {
            return Ok(raw.steps);
        }
    }

    Err(PlannerError::Unparsable(
        trimmed.chars().take(200).collect(),
    ))
}

/// Extract the content of the first ```...``` fence (with or without a
/// `json` tag).
fn fenced_json(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = text.get(start.checked_add(3)?..)?;
    let after = after.strip_prefix("json").unwrap_or(after);
    let after = after.strip_prefix('\n').unwrap_or(after);
    let end = after.find("```")?;
    Some(after.get(..end)?.trim())
}

/// Check every tool step references a registered tool.
fn validate_steps(steps: &[PlanStep], tools: &[ToolDescriptor]) -> Result<(), PlannerError> {
    for step in steps {
        if let PlanStep::Tool { tool_name, .. } = step {
            if !tools.iter().any(|t| &t.name == tool_name) {
                warn!(tool = %tool_name, "planner referenced unknown tool");
                return Err(PlannerError::UnknownTool(tool_name.clone()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{FinishReason, LlmResponse, UsageStats};
    use crate::tools::SideEffect;
    use async_trait::async_trait;

    struct ScriptedModel {
        response: String,
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn generate(&self, _request: LlmRequest) -> Result<LlmResponse, ProviderError> {
            Ok(LlmResponse {
                text: self.response.clone(),
                tool_calls: vec![],
                finish_reason: FinishReason::EndTurn,
                usage: UsageStats::default(),
            })
        }

        fn model_id(&self) -> &str {
            "scripted"
        }
    }

    fn tool(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_owned(),
            what: "test".to_owned(),
            when_to_use: "test".to_owned(),
            args_schema: serde_json::json!({"type": "object", "properties": {}}),
            side_effect: SideEffect::Read,
            index_worthy: false,
            timeout_secs: None,
        }
    }

    fn waiting_plan() -> Plan {
        let mut plan = Plan::new(
            Uuid::new_v4(),
            vec![
                PlanStep::Tool {
                    tool_name: "web_search".to_owned(),
                    args: serde_json::json!({"query": "ACME Corp"}),
                    result: Some(serde_json::json!({"results": []})),
                },
                PlanStep::WaitUser {
                    question: "Want details?".to_owned(),
                },
                PlanStep::Respond {
                    draft: "summary".to_owned(),
                },
            ],
        );
        plan.current_step_index = 2;
        plan.status = PlanStatus::WaitingUser;
        plan
    }

    #[test]
    fn test_acknowledgement_detection() {
        for ack in ["yes", "Sì, grazie", "OK", "va bene", "sounds good", "oui"] {
            assert!(is_acknowledgement(ack), "{ack:?} should be an acknowledgement");
        }
        for not_ack in [
            "yes, and also search for flights to Rome",
            "what is the weather",
            "",
            "no",
        ] {
            assert!(!is_acknowledgement(not_ack), "{not_ack:?} must not match");
        }
    }

    #[tokio::test]
    async fn test_acknowledgement_resumes_waiting_plan() {
        let planner = Planner::new(Arc::new(ScriptedModel {
            response: "should never be called".to_owned(),
        }));
        let pending = waiting_plan();

        let decision = planner
            .decide(Uuid::new_v4(), "sì, grazie", Some(&pending), &[], &[])
            .await
            .expect("decide");

        match decision {
            PlannerDecision::Resume(plan) => {
                assert_eq!(plan.id, pending.id, "no new plan is created");
                assert_eq!(plan.status, PlanStatus::Running);
                assert_eq!(plan.current_step_index, 2, "resumes after the wait step");
            }
            other => panic!("expected resume, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_acknowledgement_without_pending_plan_goes_to_model() {
        let planner = Planner::new(Arc::new(ScriptedModel {
            response: r#"{"steps":[]}"#.to_owned(),
        }));
        let decision = planner
            .decide(Uuid::new_v4(), "ok", None, &[], &[])
            .await
            .expect("decide");
        assert_eq!(decision, PlannerDecision::NoPlan);
    }

    #[tokio::test]
    async fn test_empty_message_needs_no_plan() {
        let planner = Planner::new(Arc::new(ScriptedModel {
            response: "unused".to_owned(),
        }));
        let decision = planner
            .decide(Uuid::new_v4(), "   ", None, &[], &[])
            .await
            .expect("decide");
        assert_eq!(decision, PlannerDecision::NoPlan);
    }

    #[tokio::test]
    async fn test_new_plan_parsed_and_validated() {
        let planner = Planner::new(Arc::new(ScriptedModel {
            response: r#"{"steps":[
                {"type":"tool","tool_name":"web_search","args":{"query":"rust"}},
                {"type":"respond","draft":"summarise findings"}
            ]}"#
            .to_owned(),
        }));
        let tools = vec![tool("web_search")];

        let decision = planner
            .decide(Uuid::new_v4(), "find rust news", None, &tools, &[])
            .await
            .expect("decide");

        match decision {
            PlannerDecision::NewPlan(plan) => {
                assert_eq!(plan.steps.len(), 2);
                assert_eq!(plan.status, PlanStatus::Running);
                assert!(!plan.partial);
            }
            other => panic!("expected new plan, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_plan_in_code_fence_parses() {
        let planner = Planner::new(Arc::new(ScriptedModel {
            response: "Here you go:\n```json\n{\"steps\":[{\"type\":\"respond\",\"draft\":\"hi\"}]}\n```".to_owned(),
        }));
        let decision = planner
            .decide(Uuid::new_v4(), "say hi with a plan", None, &[], &[])
            .await
            .expect("decide");
        assert!(matches!(decision, PlannerDecision::NewPlan(_)));
    }

    #[tokio::test]
    async fn test_unknown_tool_rejected() {
        let planner = Planner::new(Arc::new(ScriptedModel {
            response: r#"{"steps":[{"type":"tool","tool_name":"rm_rf","args":{}}]}"#.to_owned(),
        }));
        let result = planner
            .decide(Uuid::new_v4(), "do the thing", None, &[tool("web_search")], &[])
            .await;
        assert!(matches!(result, Err(PlannerError::UnknownTool(_))));
    }

    #[tokio::test]
    async fn test_six_step_plan_truncated_and_partial() {
        let steps: Vec<String> = (0..6)
            .map(|i| format!(r#"{{"type":"tool","tool_name":"t{i}","args":{{}}}}"#))
            .collect();
        let response = format!(r#"{{"steps":[{}]}}"#, steps.join(","));
        let tools: Vec<ToolDescriptor> = (0..6).map(|i| tool(&format!("t{i}"))).collect();

        let planner = Planner::new(Arc::new(ScriptedModel { response }));
        let decision = planner
            .decide(Uuid::new_v4(), "a very long pipeline", None, &tools, &[])
            .await
            .expect("decide");

        match decision {
            PlannerDecision::NewPlan(plan) => {
                assert_eq!(plan.steps.len(), 5, "truncated at the step cap");
                assert!(plan.partial, "truncation is flagged");
            }
            other => panic!("expected new plan, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unparsable_response_is_an_error() {
        let planner = Planner::new(Arc::new(ScriptedModel {
            response: "I cannot help with that.".to_owned(),
        }));
        let result = planner
            .decide(Uuid::new_v4(), "plan something", None, &[], &[])
            .await;
        assert!(matches!(result, Err(PlannerError::Unparsable(_))));
    }

    #[test]
    fn test_force_web_search_override() {
        // Acknowledgements never force a search.
        assert!(!Planner::effective_force_web_search("sì, grazie", true));
        // Short messages without web intent drop the flag.
        assert!(!Planner::effective_force_web_search("thanks a lot", true));
        // Short messages with web intent keep it.
        assert!(Planner::effective_force_web_search("search rust", true));
        // Long messages keep the caller's flag.
        assert!(Planner::effective_force_web_search(
            "please find the latest release notes",
            true
        ));
        // Never forced when the caller did not ask.
        assert!(!Planner::effective_force_web_search("search rust", false));
    }
}
