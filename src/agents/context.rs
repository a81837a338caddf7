//! Context loading node: short-term window and relevant memories.

use std::sync::Arc;

use tracing::warn;

use crate::kernel::graph::{GraphCtx, Node};
use crate::kernel::state::RequestState;
use crate::memory::{MemoryManager, MemoryScope};

/// Memories retrieved per request.
const CONTEXT_MEMORIES: usize = 5;

/// Fills the state with the session's short-term window and the user's
/// most relevant long-term memories. Retrieval failures degrade to an
/// empty context; they never fail the request.
pub struct LoadContextNode {
    memory: Arc<MemoryManager>,
}

impl LoadContextNode {
    /// Create the node over the memory manager.
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        Self { memory }
    }
}

#[async_trait::async_trait]
impl Node for LoadContextNode {
    fn name(&self) -> &'static str {
        "load_context"
    }

    async fn run(&self, mut state: RequestState, _ctx: &GraphCtx) -> RequestState {
        state.short_history = self.memory.short_term(state.session_id).await;

        if !state.message.content.trim().is_empty() {
            let scope = MemoryScope::User {
                tenant_id: state.tenant_id,
                user_id: state.user_id,
            };
            match self
                .memory
                .query(scope, &state.message.content, CONTEXT_MEMORIES, None)
                .await
            {
                Ok(outcome) => {
                    state.memories = outcome.hits;
                    state.memory_degraded = outcome.degraded;
                }
                Err(err) => {
                    warn!(error = %err, "memory retrieval failed; continuing without context");
                }
            }
        }

        state
    }
}
