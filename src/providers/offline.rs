//! Offline fallback model.
//!
//! Serves deterministic answers when no real provider is configured:
//! planning calls get an empty plan, comparison calls a non-verdict,
//! extraction calls an empty list, and response calls a plain echo of the
//! user message. Useful for smoke tests and for running the scheduler and
//! pollers without model credentials.

use async_trait::async_trait;

use super::{FinishReason, LanguageModel, LlmRequest, LlmResponse, ProviderError, UsageStats};

/// Deterministic provider-free model.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineModel;

#[async_trait]
impl LanguageModel for OfflineModel {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, ProviderError> {
        let system = request.system.as_deref().unwrap_or_default();

        let text = if system.contains("planning stage") {
            r#"{"steps":[]}"#.to_owned()
        } else if system.contains("compare two statements") {
            r#"{"contradiction":false,"confidence":0.0,"rationale":"offline"}"#.to_owned()
        } else if system.contains("extract durable knowledge") {
            "[]".to_owned()
        } else {
            let last_user = request
                .messages
                .iter()
                .rev()
                .find(|m| m.role == crate::types::MessageRole::User)
                .map(|m| m.content.as_str())
                .unwrap_or_default();
            format!(
                "No language model is configured, so I can only acknowledge your message: \
                 {last_user}"
            )
        };

        Ok(LlmResponse {
            text,
            tool_calls: vec![],
            finish_reason: FinishReason::EndTurn,
            usage: UsageStats::default(),
        })
    }

    fn model_id(&self) -> &str {
        "offline"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::PromptMessage;

    #[tokio::test]
    async fn test_planner_calls_get_empty_plan() {
        let model = OfflineModel;
        let response = model
            .generate(LlmRequest::text(
                "You are the planning stage of an assistant runtime.",
                vec![PromptMessage::user("search for rust news")],
            ))
            .await
            .expect("generate");
        assert_eq!(response.text, r#"{"steps":[]}"#);
    }

    #[tokio::test]
    async fn test_chat_calls_echo() {
        let model = OfflineModel;
        let response = model
            .generate(LlmRequest::text(
                "You are the assistant's response stage.",
                vec![PromptMessage::user("hello there")],
            ))
            .await
            .expect("generate");
        assert!(response.text.contains("hello there"));
    }
}
