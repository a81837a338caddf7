//! Integration tests for the priority task queue.

#[path = "queue/backpressure_test.rs"]
mod backpressure_test;
