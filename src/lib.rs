//! Armitage — a multi-agent assistant runtime.
//!
//! The crate's core is an orchestration kernel: user messages and
//! external events flow through a static graph of agent nodes while
//! background agents (knowledge extraction, integrity checks, pollers)
//! run detached on a bounded worker pool. State lives in a three-tier
//! memory system over SQLite and a pluggable vector store. External
//! concerns — LLM vendors, OAuth, transports — stay behind collaborator
//! traits.
#![allow(missing_docs)]

pub mod agents;
pub mod budget;
pub mod config;
pub mod integrity;
pub mod kernel;
pub mod logging;
pub mod memory;
pub mod notify;
pub mod pollers;
pub mod providers;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod tools;
pub mod types;
pub mod workers;
