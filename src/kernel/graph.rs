//! Deterministic agent graph executor.
//!
//! The graph is static: nodes and edges are declared at startup, and the
//! only runtime influence on routing is the state itself, evaluated by
//! pure edge guards. Nodes run sequentially on the request's critical
//! path; detached background work goes through the
//! [`WorkerPool`](crate::workers::WorkerPool) carried in [`GraphCtx`] and
//! never delays the response.
//!
//! Expected failures are encoded in the state by the nodes themselves
//! (degraded tool records, fallback drafts). A panicking node is caught
//! here and turned into a fixed apology response.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error};

use crate::workers::WorkerPool;

use super::state::RequestState;

/// Response when a node fails in a way the state cannot encode.
pub const APOLOGY_MESSAGE: &str =
    "I'm sorry — something went wrong while handling your request. Please try again.";

/// Upper bound on node executions per request, a backstop against
/// accidental cycles.
const MAX_NODE_RUNS: usize = 32;

/// Shared services available to nodes.
#[derive(Clone)]
pub struct GraphCtx {
    /// Pool for detached background tasks.
    pub workers: Arc<WorkerPool>,
}

/// A graph node: a pure transformation over the request state.
///
/// Nodes degrade internally and always return a state; only unexpected
/// panics escape, and the executor converts those to an apology.
#[async_trait::async_trait]
pub trait Node: Send + Sync {
    /// Stable node name used in edges and logs.
    fn name(&self) -> &'static str;

    /// Transform the state.
    async fn run(&self, state: RequestState, ctx: &GraphCtx) -> RequestState;
}

type Guard = Arc<dyn Fn(&RequestState) -> bool + Send + Sync>;

struct EdgeDef {
    to: &'static str,
    guard: Option<Guard>,
}

/// Errors from graph construction.
#[derive(Debug, thiserror::Error)]
pub enum GraphBuildError {
    /// An edge references a node that was never added.
    #[error("edge references unknown node {0:?}")]
    UnknownNode(&'static str),
    /// No entry node was declared.
    #[error("graph has no entry node")]
    MissingEntry,
    /// No terminal node was declared.
    #[error("graph has no terminal node")]
    MissingTerminal,
}

/// Builder for a [`Graph`].
#[derive(Default)]
pub struct GraphBuilder {
    nodes: HashMap<&'static str, Arc<dyn Node>>,
    edges: HashMap<&'static str, Vec<EdgeDef>>,
    entry: Option<&'static str>,
    terminal: Option<&'static str>,
}

impl GraphBuilder {
    /// Start an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node.
    pub fn node(mut self, node: Arc<dyn Node>) -> Self {
        self.nodes.insert(node.name(), node);
        self
    }

    /// Add an unconditional edge.
    pub fn edge(mut self, from: &'static str, to: &'static str) -> Self {
        self.edges
            .entry(from)
            .or_default()
            .push(EdgeDef { to, guard: None });
        self
    }

    /// Add an edge guarded by a pure predicate. Edges are tried in
    /// insertion order; the first passing guard wins.
    pub fn edge_if<F>(mut self, from: &'static str, to: &'static str, guard: F) -> Self
    where
        F: Fn(&RequestState) -> bool + Send + Sync + 'static,
    {
        self.edges.entry(from).or_default().push(EdgeDef {
            to,
            guard: Some(Arc::new(guard)),
        });
        self
    }

    /// Declare the single entry node.
    pub fn entry(mut self, name: &'static str) -> Self {
        self.entry = Some(name);
        self
    }

    /// Declare the single terminal node.
    pub fn terminal(mut self, name: &'static str) -> Self {
        self.terminal = Some(name);
        self
    }

    /// Validate and build the graph.
    ///
    /// # Errors
    ///
    /// Returns an error when entry/terminal are missing or an edge
    /// references an unknown node.
    pub fn build(self) -> Result<Graph, GraphBuildError> {
        let entry = self.entry.ok_or(GraphBuildError::MissingEntry)?;
        let terminal = self.terminal.ok_or(GraphBuildError::MissingTerminal)?;

        if !self.nodes.contains_key(entry) {
            return Err(GraphBuildError::UnknownNode(entry));
        }
        if !self.nodes.contains_key(terminal) {
            return Err(GraphBuildError::UnknownNode(terminal));
        }
        for (from, edges) in &self.edges {
            if !self.nodes.contains_key(*from) {
                return Err(GraphBuildError::UnknownNode(*from));
            }
            for edge in edges {
                if !self.nodes.contains_key(edge.to) {
                    return Err(GraphBuildError::UnknownNode(edge.to));
                }
            }
        }

        Ok(Graph {
            nodes: self.nodes,
            edges: self.edges,
            entry,
            terminal,
        })
    }
}

/// A validated agent graph.
pub struct Graph {
    nodes: HashMap<&'static str, Arc<dyn Node>>,
    edges: HashMap<&'static str, Vec<EdgeDef>>,
    entry: &'static str,
    terminal: &'static str,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.nodes.len())
            .field("entry", &self.entry)
            .field("terminal", &self.terminal)
            .finish()
    }
}

impl Graph {
    /// Execute the graph from entry to terminal.
    ///
    /// A panicking node or a routing dead-end yields the apology state
    /// instead of propagating.
    pub async fn run(&self, mut state: RequestState, ctx: &GraphCtx) -> RequestState {
        let mut current = self.entry;
        let mut runs = 0usize;

        loop {
            runs = runs.saturating_add(1);
            if runs > MAX_NODE_RUNS {
                error!(node = current, "node run limit exceeded; aborting request");
                return apologise(state);
            }

            let Some(node) = self.nodes.get(current).cloned() else {
                error!(node = current, "routing reached unknown node");
                return apologise(state);
            };

            debug!(node = current, "running node");
            let ctx_clone = ctx.clone();
            let handle = tokio::spawn(async move { node.run(state, &ctx_clone).await });
            // Cancelling the request (dropping this future) aborts the
            // node and with it any in-flight tool or model calls.
            // Aborting an already-finished task is a no-op.
            let _abort_guard = AbortOnDrop(handle.abort_handle());
            state = match handle.await {
                Ok(next) => next,
                Err(join_error) => {
                    error!(node = current, panicked = join_error.is_panic(), "node crashed");
                    // The state moved into the crashed task; rebuild the
                    // response from nothing but the apology.
                    let mut empty = RequestState::placeholder_after_crash();
                    empty.assistant_draft = Some(APOLOGY_MESSAGE.to_owned());
                    return empty;
                }
            };

            if current == self.terminal {
                return state;
            }

            let next = self
                .edges
                .get(current)
                .and_then(|edges| {
                    edges
                        .iter()
                        .find(|e| e.guard.as_ref().is_none_or(|g| g(&state)))
                })
                .map(|e| e.to);

            match next {
                Some(next) => current = next,
                None => {
                    error!(node = current, "no edge matched; aborting request");
                    return apologise(state);
                }
            }
        }
    }
}

fn apologise(mut state: RequestState) -> RequestState {
    state.assistant_draft = Some(APOLOGY_MESSAGE.to_owned());
    state
}

struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl RequestState {
    /// A minimal state used only when a node panicked and took the real
    /// state with it.
    fn placeholder_after_crash() -> Self {
        use crate::types::{Message, MessageRole, Session, SessionStatus};
        let nil = uuid::Uuid::nil();
        let session = Session {
            id: nil,
            tenant_id: nil,
            user_id: nil,
            title: String::new(),
            status: SessionStatus::Active,
            metadata: serde_json::Map::new(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let message = Message::new(nil, nil, MessageRole::System, "");
        Self::new(session, message)
    }
}
