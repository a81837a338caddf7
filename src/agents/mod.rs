//! Agent nodes and background agents.
//!
//! Graph nodes (context loader, planner, tool loop, main agent,
//! notification collector) are pure transformations over
//! [`RequestState`](crate::kernel::state::RequestState). The knowledge
//! agent runs detached from the critical path and writes only into the
//! append-only stores.

pub mod collector;
pub mod context;
pub mod knowledge;
pub mod main_agent;
pub mod planning;
pub mod tool_loop;

pub use collector::NotificationCollectorNode;
pub use context::LoadContextNode;
pub use knowledge::KnowledgeAgent;
pub use main_agent::MainAgentNode;
pub use planning::PlanNode;
pub use tool_loop::ToolLoopNode;
