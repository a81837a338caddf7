//! Integration tests for the orchestration kernel.

#[path = "kernel/plan_resume_test.rs"]
mod plan_resume_test;
#[path = "kernel/scenario_test.rs"]
mod scenario_test;
