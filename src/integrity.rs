//! Semantic integrity checker: contradiction detection over memories.
//!
//! For a new knowledge item the checker fetches the most similar
//! high-importance memories, pre-filters pairs that cannot meaningfully
//! contradict (mismatched kinds, near-duplicates), and runs the remaining
//! comparisons through the model in parallel. A contradiction is reported
//! only at or above the confidence floor; reporting enqueues a
//! `resolve_contradiction` task and publishes a blocking notification.
//! The check always runs in the background and never delays a response.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::budget::DailyBudget;
use crate::memory::search::string_similarity;
use crate::memory::{MemoryManager, MemoryScope};
use crate::notify::NotificationCenter;
use crate::providers::{LanguageModel, LlmRequest, PromptMessage};
use crate::queue::TaskQueue;
use crate::types::{Notification, Priority, Task};

/// Similar memories compared per new item.
const CANDIDATE_COUNT: usize = 5;

/// Importance floor for candidate memories.
const CANDIDATE_MIN_IMPORTANCE: f64 = 0.7;

/// String similarity above which a pair is a duplicate, not a
/// contradiction.
const DUPLICATE_SIMILARITY: f64 = 0.95;

/// Confidence floor for reporting a contradiction.
const CONFIDENCE_FLOOR: f64 = 0.90;

/// Estimated tokens per comparison call, for the budget pre-check.
const ESTIMATED_COMPARISON_TOKENS: u64 = 400;

/// Comparison prompt; the model answers with a JSON verdict.
const COMPARISON_SYSTEM_PROMPT: &str = "\
You compare two statements about the same person and decide whether they \
logically contradict each other. Paraphrases, partial overlaps and \
unrelated statements are NOT contradictions.

Answer ONLY with JSON: \
{\"contradiction\":bool,\"confidence\":0.0-1.0,\"rationale\":\"...\"}";

/// Kind of a knowledge item under check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnowledgeKind {
    /// A durable fact.
    Fact,
    /// An explicitly stated preference.
    Preference,
    /// A dated event.
    Event,
}

/// An atomic knowledge item extracted from a user turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeItem {
    /// Item kind.
    pub kind: KnowledgeKind,
    /// Importance in [0, 1].
    pub importance: f64,
    /// Self-contained statement.
    pub text: String,
}

/// Verdict returned by the comparison model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ComparisonVerdict {
    /// Whether the statements contradict.
    pub contradiction: bool,
    /// Model confidence in [0, 1].
    pub confidence: f64,
    /// Short explanation.
    #[serde(default)]
    pub rationale: String,
}

/// A reported contradiction.
#[derive(Debug, Clone, PartialEq)]
pub struct Contradiction {
    /// Id of the existing memory.
    pub memory_id: Uuid,
    /// The existing statement.
    pub existing: String,
    /// The new statement.
    pub incoming: String,
    /// Model confidence.
    pub confidence: f64,
    /// Model rationale.
    pub rationale: String,
}

/// The integrity checking service.
pub struct IntegrityChecker {
    memory: Arc<MemoryManager>,
    model: Arc<dyn LanguageModel>,
    queue: Arc<TaskQueue>,
    notify: Arc<NotificationCenter>,
    budget: Arc<DailyBudget>,
}

impl std::fmt::Debug for IntegrityChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityChecker").finish_non_exhaustive()
    }
}

impl IntegrityChecker {
    /// Create the checker.
    pub fn new(
        memory: Arc<MemoryManager>,
        model: Arc<dyn LanguageModel>,
        queue: Arc<TaskQueue>,
        notify: Arc<NotificationCenter>,
        budget: Arc<DailyBudget>,
    ) -> Self {
        Self {
            memory,
            model,
            queue,
            notify,
            budget,
        }
    }

    /// Check a new item against the user's existing memories, reporting
    /// any contradiction at or above the confidence floor.
    ///
    /// # Errors
    ///
    /// Returns an error on memory retrieval failure; comparison failures
    /// are logged per candidate and skipped.
    pub async fn check(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        session_id: Option<Uuid>,
        item: &KnowledgeItem,
    ) -> anyhow::Result<Vec<Contradiction>> {
        let scope = MemoryScope::User { tenant_id, user_id };
        let candidates = self
            .memory
            .query(scope, &item.text, CANDIDATE_COUNT, Some(CANDIDATE_MIN_IMPORTANCE))
            .await?;

        // Pre-filter before spending model tokens.
        let survivors: Vec<(Uuid, String)> = candidates
            .hits
            .into_iter()
            .filter(|hit| {
                if !kinds_comparable(item.kind, infer_kind(&hit.content)) {
                    return false;
                }
                string_similarity(&item.text, &hit.content) <= DUPLICATE_SIMILARITY
            })
            .map(|hit| (hit.id, hit.content))
            .collect();

        if survivors.is_empty() {
            return Ok(Vec::new());
        }

        let estimated =
            ESTIMATED_COMPARISON_TOKENS.saturating_mul(survivors.len().try_into().unwrap_or(1));
        if let Err(err) = self.budget.check(estimated) {
            warn!(error = %err, "integrity check skipped: budget exhausted");
            return Ok(Vec::new());
        }

        // Compare all surviving pairs in parallel.
        let mut comparisons: JoinSet<Option<Contradiction>> = JoinSet::new();
        for (memory_id, existing) in survivors {
            let model = self.model.clone();
            let budget = self.budget.clone();
            let incoming = item.text.clone();
            comparisons.spawn(async move {
                compare_pair(model.as_ref(), budget.as_ref(), memory_id, &existing, &incoming)
                    .await
            });
        }

        let mut contradictions = Vec::new();
        while let Some(joined) = comparisons.join_next().await {
            match joined {
                Ok(Some(contradiction)) => contradictions.push(contradiction),
                Ok(None) => {}
                Err(err) => warn!(error = %err, "comparison task failed"),
            }
        }

        for contradiction in &contradictions {
            self.report(tenant_id, user_id, session_id, contradiction)
                .await;
        }

        Ok(contradictions)
    }

    /// Enqueue the resolution task and publish the blocking notification.
    async fn report(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        session_id: Option<Uuid>,
        contradiction: &Contradiction,
    ) {
        info!(
            memory_id = %contradiction.memory_id,
            confidence = contradiction.confidence,
            "contradiction detected"
        );

        let payload = serde_json::json!({
            "memory_id": contradiction.memory_id,
            "existing": contradiction.existing,
            "incoming": contradiction.incoming,
            "confidence": contradiction.confidence,
            "rationale": contradiction.rationale,
            "resolution_options": ["choose_existing", "choose_incoming", "no_contradiction", "merge_with_context"],
        });

        let task = Task::new(
            Priority::High,
            "integrity_checker",
            "resolve_contradiction",
            payload.clone(),
        );
        self.queue.enqueue(task);

        let mut notification = Notification::new(
            tenant_id,
            user_id,
            "contradiction_detected",
            Priority::Critical,
            payload,
        )
        .with_reference(&contradiction.memory_id.to_string());
        if let Some(session_id) = session_id {
            notification = notification.with_session(session_id);
        }
        if let Err(err) = self.notify.publish(notification).await {
            warn!(error = %err, "failed to publish contradiction notification");
        }
    }
}

/// Run one comparison through the model. Failures and sub-floor verdicts
/// yield `None`.
async fn compare_pair(
    model: &dyn LanguageModel,
    budget: &DailyBudget,
    memory_id: Uuid,
    existing: &str,
    incoming: &str,
) -> Option<Contradiction> {
    let request = LlmRequest::text(
        COMPARISON_SYSTEM_PROMPT,
        vec![PromptMessage::user(&format!(
            "Statement A: {existing}\nStatement B: {incoming}"
        ))],
    );

    let response = match model.generate(request).await {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, "comparison model call failed");
            return None;
        }
    };
    budget.record(response.usage.total());

    let verdict = match parse_verdict(&response.text) {
        Some(verdict) => verdict,
        None => {
            warn!(preview = %response.text.chars().take(80).collect::<String>(),
                  "unparsable comparison verdict");
            return None;
        }
    };

    if !verdict.contradiction || verdict.confidence < CONFIDENCE_FLOOR {
        debug!(
            contradiction = verdict.contradiction,
            confidence = verdict.confidence,
            "pair below reporting floor"
        );
        return None;
    }

    Some(Contradiction {
        memory_id,
        existing: existing.to_owned(),
        incoming: incoming.to_owned(),
        confidence: verdict.confidence,
        rationale: verdict.rationale,
    })
}

/// Parse the model's JSON verdict, tolerating fenced or noisy output.
fn parse_verdict(text: &str) -> Option<ComparisonVerdict> {
    let trimmed = text.trim();
    if let Ok(verdict) = serde_json::from_str(trimmed) {
        return Some(verdict);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    serde_json::from_str(trimmed.get(start..=end)?).ok()
}

/// Guess the kind of a stored memory from preference verbs.
fn infer_kind(content: &str) -> KnowledgeKind {
    const PREFERENCE_MARKERS: &[&str] = &[
        "prefers", "prefer", "likes", "like", "loves", "love", "hates", "hate", "favourite",
        "favorite", "preferisce", "prefiere",
    ];
    let lower = content.to_lowercase();
    if PREFERENCE_MARKERS.iter().any(|m| lower.contains(m)) {
        KnowledgeKind::Preference
    } else {
        KnowledgeKind::Fact
    }
}

/// A preference cannot contradict a fact; everything else is comparable.
fn kinds_comparable(a: KnowledgeKind, b: KnowledgeKind) -> bool {
    let a_pref = a == KnowledgeKind::Preference;
    let b_pref = b == KnowledgeKind::Preference;
    a_pref == b_pref
}
