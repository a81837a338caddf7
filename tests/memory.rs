//! Integration tests for the memory manager.

#[path = "memory/invariants_test.rs"]
mod invariants_test;
