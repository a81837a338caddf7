//! Knowledge agent: background extraction of durable facts.
//!
//! Analyses the latest user turn with a cheap model and keeps only
//! explicitly stated preferences and durable facts — casual mentions are
//! discarded by the importance floor. Extracted items pass through the
//! integrity checker, then land in long-term memory. Runs detached from
//! the request; failures are logged and never affect the response.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::budget::DailyBudget;
use crate::integrity::{IntegrityChecker, KnowledgeItem};
use crate::kernel::state::StateSnapshot;
use crate::memory::MemoryManager;
use crate::providers::{LanguageModel, LlmRequest, PromptMessage};

/// Estimated tokens per extraction call, for the budget pre-check.
const ESTIMATED_EXTRACTION_TOKENS: u64 = 500;

/// Minimum importance for keeping an extraction.
const MIN_IMPORTANCE: f64 = 0.5;

/// Extraction prompt: conservative, JSON-only output.
const EXTRACTION_SYSTEM_PROMPT: &str = "\
You extract durable knowledge about the user from their latest message.
Output a JSON array; each element is
{\"kind\":\"fact\"|\"preference\"|\"event\",\"importance\":0.0-1.0,\"text\":\"...\"}.

Keep only:
- facts that will still be true in a month,
- preferences the user states explicitly (verbs like prefer, like, hate),
- concrete dated events.
Discard greetings, small talk and casual mentions. Be conservative.
If nothing qualifies, output [].";

/// The background knowledge extraction agent.
pub struct KnowledgeAgent {
    model: Arc<dyn LanguageModel>,
    memory: Arc<MemoryManager>,
    integrity: Arc<IntegrityChecker>,
    budget: Arc<DailyBudget>,
}

impl std::fmt::Debug for KnowledgeAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeAgent").finish_non_exhaustive()
    }
}

impl KnowledgeAgent {
    /// Create the agent.
    pub fn new(
        model: Arc<dyn LanguageModel>,
        memory: Arc<MemoryManager>,
        integrity: Arc<IntegrityChecker>,
        budget: Arc<DailyBudget>,
    ) -> Self {
        Self {
            model,
            memory,
            integrity,
            budget,
        }
    }

    /// Full background pass over a request snapshot: extract, check
    /// integrity, store. Returns the number of items written.
    pub async fn process(&self, snapshot: StateSnapshot) -> usize {
        let items = match self.extract(&snapshot).await {
            Ok(items) => items,
            Err(err) => {
                warn!(error = %err, "knowledge extraction failed");
                return 0;
            }
        };

        let mut written = 0usize;
        for item in items {
            if let Err(err) = self
                .integrity
                .check(
                    snapshot.tenant_id,
                    snapshot.user_id,
                    Some(snapshot.session_id),
                    &item,
                )
                .await
            {
                warn!(error = %err, "integrity check failed; storing item anyway");
            }

            match self
                .memory
                .add_long(
                    snapshot.tenant_id,
                    snapshot.user_id,
                    &item.text,
                    item.importance,
                    &[snapshot.session_id],
                )
                .await
            {
                Ok(_) => written = written.saturating_add(1),
                Err(err) => warn!(error = %err, "failed to store extracted knowledge"),
            }
        }

        debug!(written, "knowledge pass finished");
        written
    }

    /// Extract knowledge items from the snapshot's user turn.
    ///
    /// # Errors
    ///
    /// Returns an error when the budget is exhausted or the model call
    /// fails. Unparsable output yields an empty list instead.
    pub async fn extract(&self, snapshot: &StateSnapshot) -> anyhow::Result<Vec<KnowledgeItem>> {
        let text = snapshot.message.content.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }

        self.budget.check(ESTIMATED_EXTRACTION_TOKENS)?;

        let request = LlmRequest::text(
            EXTRACTION_SYSTEM_PROMPT,
            vec![PromptMessage::user(text)],
        );
        let response = self.model.generate(request).await?;
        self.budget.record(response.usage.total());

        Ok(parse_items(&response.text))
    }
}

/// Parse the extraction JSON array, filtering by the importance floor.
///
/// Returns an empty list on any parse error (logged, never fatal).
pub fn parse_items(text: &str) -> Vec<KnowledgeItem> {
    let trimmed = text.trim();
    let json_text = match (trimmed.find('['), trimmed.rfind(']')) {
        (Some(start), Some(end)) if start < end => trimmed.get(start..=end).unwrap_or(trimmed),
        _ => trimmed,
    };

    let items: Vec<KnowledgeItem> = match serde_json::from_str(json_text) {
        Ok(items) => items,
        Err(err) => {
            warn!(
                error = %err,
                preview = %trimmed.chars().take(120).collect::<String>(),
                "failed to parse extraction JSON"
            );
            return Vec::new();
        }
    };

    items
        .into_iter()
        .filter(|item| item.importance >= MIN_IMPORTANCE && !item.text.is_empty())
        .collect()
}
