//! Backpressure and fairness under load.

use std::sync::Arc;

use armitage::queue::{EnqueueOutcome, TaskQueue};
use armitage::types::{Priority, Task, TaskStatus};

fn task(priority: Priority, label: &str) -> Task {
    Task::new(priority, "load-test", label, serde_json::json!({}))
}

#[tokio::test]
async fn test_twenty_thousand_info_tasks_respect_soft_cap() {
    let queue = TaskQueue::new(10_000, 300);

    let mut dropped = 0u64;
    for i in 0..20_000u32 {
        if queue.enqueue(task(Priority::Info, &format!("info{i}"))) == EnqueueOutcome::Dropped {
            dropped += 1;
        }
    }

    let stats = queue.stats();
    assert_eq!(stats.pending, 10_000, "at most the soft cap is retained");
    assert_eq!(stats.dropped, 10_000);
    assert_eq!(dropped, 10_000);

    // Critical work is never shed, even over the cap.
    assert_eq!(
        queue.enqueue(task(Priority::Critical, "must-run")),
        EnqueueOutcome::Enqueued
    );
    let first = queue.dequeue().await;
    assert_eq!(first.kind, "must-run", "critical jumps the info backlog");
}

#[tokio::test]
async fn test_dequeue_order_across_priorities() {
    let queue = TaskQueue::new(100, 300);
    queue.enqueue(task(Priority::Low, "A"));
    queue.enqueue(task(Priority::High, "B"));
    queue.enqueue(task(Priority::Medium, "C"));
    queue.enqueue(task(Priority::High, "D"));

    let mut order = Vec::new();
    for _ in 0..4 {
        let t = queue.dequeue().await;
        order.push(t.kind.clone());
        queue.complete(t.id, TaskStatus::Completed).expect("complete");
    }
    assert_eq!(order, ["B", "D", "C", "A"]);
}

#[tokio::test]
async fn test_many_consumers_each_task_delivered_once() {
    let queue = Arc::new(TaskQueue::new(1000, 300));
    for i in 0..100u32 {
        queue.enqueue(task(Priority::Medium, &format!("job{i}")));
    }

    let mut consumers = Vec::new();
    for _ in 0..4 {
        let queue = queue.clone();
        consumers.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            loop {
                let stats = queue.stats();
                if stats.pending == 0 {
                    break;
                }
                let t = tokio::select! {
                    t = queue.dequeue() => t,
                    () = tokio::time::sleep(std::time::Duration::from_millis(200)) => break,
                };
                seen.push(t.kind.clone());
                queue.complete(t.id, TaskStatus::Completed).expect("complete");
            }
            seen
        }));
    }

    let mut all = Vec::new();
    for consumer in consumers {
        all.extend(consumer.await.expect("join"));
    }
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 100, "every task delivered to exactly one consumer");
}
