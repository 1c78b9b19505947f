//! End-to-end scheduler tests over the public API: queue semantics under
//! concurrency, throttling, execution deadlines, and panic isolation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use taskmill::core::monitor::StaticProbe;
use taskmill::infra::queue::{QueueBackend, RedisQueue};
use taskmill::{
    HandlerRegistry, ManagerConfig, PersistenceStore, PriorityTaskQueue, ResourceMonitor, Task,
    TaskId, TaskManager, TaskPriority, TaskSpec, TaskStatus,
};

fn idle_probe(cores: usize) -> Arc<StaticProbe> {
    Arc::new(StaticProbe {
        cpu_percent: 10.0,
        memory_percent: 10.0,
        cores,
    })
}

fn test_config() -> ManagerConfig {
    ManagerConfig::default()
        .with_in_memory_store()
        .with_poll_timeout(Duration::from_millis(100))
        .with_throttle_pause(Duration::from_millis(50))
        .with_retry_backoff(Duration::from_millis(50))
}

fn build_manager(
    config: ManagerConfig,
    registry: HandlerRegistry,
    probe: Arc<StaticProbe>,
) -> Arc<TaskManager> {
    let monitor = Arc::new(ResourceMonitor::new(probe, &config));
    let queue = Arc::new(PriorityTaskQueue::in_memory());
    let store = Arc::new(PersistenceStore::in_memory().expect("in-memory store"));
    Arc::new(TaskManager::with_parts(
        config, queue, monitor, registry, store,
    ))
}

async fn wait_for_terminal(manager: &TaskManager, id: &TaskId) -> taskmill::TaskRecord {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(record) = manager.get_task_status(id).expect("status query") {
            if record.status.is_terminal() {
                return record;
            }
        }
        assert!(
            Instant::now() < deadline,
            "task {id} never reached a terminal status"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn queue_orders_by_priority_then_fifo() {
    let queue = PriorityTaskQueue::in_memory();
    let submissions = [
        ("batch-job", TaskPriority::Batch),
        ("first-high", TaskPriority::High),
        ("background", TaskPriority::Low),
        ("second-high", TaskPriority::High),
        ("heartbeat", TaskPriority::Critical),
    ];
    for (name, priority) in submissions {
        let task = Task::from_spec(TaskSpec::new(name, "noop").with_priority(priority));
        assert!(queue.put(&task).await.unwrap());
    }
    assert_eq!(queue.size().await.unwrap(), 5);

    let mut order = Vec::new();
    while let Some(task) = queue.get(Duration::from_millis(10)).await.unwrap() {
        order.push(task.name);
    }
    assert_eq!(
        order,
        vec![
            "heartbeat",
            "first-high",
            "second-high",
            "background",
            "batch-job"
        ]
    );
    assert_eq!(queue.size().await.unwrap(), 0);
}

#[tokio::test]
async fn concurrent_consumers_never_share_a_task() {
    let queue = Arc::new(PriorityTaskQueue::in_memory());
    let total = 200;
    for i in 0..total {
        let task = Task::from_spec(TaskSpec::new(format!("task-{i}"), "noop"));
        queue.put(&task).await.unwrap();
    }

    let mut consumers = Vec::new();
    for _ in 0..8 {
        let queue = Arc::clone(&queue);
        consumers.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(task) = queue.get(Duration::from_millis(50)).await.unwrap() {
                seen.push(task.id);
            }
            seen
        }));
    }

    let mut all: Vec<TaskId> = Vec::new();
    for consumer in consumers {
        all.extend(consumer.await.unwrap());
    }
    let distinct: HashSet<TaskId> = all.iter().copied().collect();
    assert_eq!(all.len(), total, "every task delivered exactly once");
    assert_eq!(distinct.len(), total, "no task delivered twice");
}

#[tokio::test]
async fn empty_get_blocks_until_timeout() {
    let queue = PriorityTaskQueue::in_memory();
    let started = Instant::now();
    assert!(queue.get(Duration::from_millis(150)).await.unwrap().is_none());
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn throttled_workers_leave_the_queue_alone() {
    let probe = Arc::new(StaticProbe {
        cpu_percent: 95.0,
        memory_percent: 10.0,
        cores: 4,
    });
    let mut registry = HandlerRegistry::new();
    registry.register_fn("noop", |_args, _kwargs| async move { Ok(json!(null)) });
    let manager = build_manager(test_config(), registry, probe);
    manager.start(None).unwrap();

    let id = manager
        .submit_task(TaskSpec::new("parked", "noop"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let record = manager.get_task_status(&id).unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Queued, "task must stay queued");

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn execution_deadline_is_enforced() {
    let mut registry = HandlerRegistry::new();
    registry.register_fn("sleepy", |_args, _kwargs| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(json!("never"))
    });
    let manager = build_manager(test_config(), registry, idle_probe(3));
    manager.start(None).unwrap();

    let id = manager
        .submit_task(
            TaskSpec::new("over-deadline", "sleepy")
                .with_timeout(Duration::from_millis(100))
                .with_max_retries(0),
        )
        .await
        .unwrap();

    let record = wait_for_terminal(&manager, &id).await;
    assert_eq!(record.status, TaskStatus::Failed);
    assert!(
        record.error.as_deref().unwrap_or_default().contains("timed out"),
        "error should name the deadline: {:?}",
        record.error
    );

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn handler_panics_do_not_kill_the_worker() {
    let mut registry = HandlerRegistry::new();
    registry.register_fn("explodes", |_args, _kwargs| async move { panic!("boom") });
    registry.register_fn("survives", |_args, _kwargs| async move { Ok(json!("ok")) });
    let manager = build_manager(test_config(), registry, idle_probe(2));
    manager.start(None).unwrap();

    let panicking = manager
        .submit_task(TaskSpec::new("kaboom", "explodes").with_max_retries(0))
        .await
        .unwrap();
    let record = wait_for_terminal(&manager, &panicking).await;
    assert_eq!(record.status, TaskStatus::Failed);
    assert!(record
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("panicked"));

    // The same pool still executes subsequent tasks.
    let follow_up = manager
        .submit_task(TaskSpec::new("after the storm", "survives"))
        .await
        .unwrap();
    let record = wait_for_terminal(&manager, &follow_up).await;
    assert_eq!(record.status, TaskStatus::Completed);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn retry_schedule_applies_linear_backoff() {
    let mut registry = HandlerRegistry::new();
    registry.register_fn("flaky", |_args, _kwargs| async move {
        Err(anyhow::anyhow!("transient"))
    });
    let manager = build_manager(test_config(), registry, idle_probe(2));
    manager.start(None).unwrap();

    let started = Instant::now();
    let id = manager
        .submit_task(TaskSpec::new("flaky-job", "flaky").with_max_retries(2))
        .await
        .unwrap();
    let record = wait_for_terminal(&manager, &id).await;

    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.retry_count, 2);
    // Two retries with a 50 ms backoff unit: at least 50 + 100 ms of delay.
    assert!(started.elapsed() >= Duration::from_millis(150));

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn dashboard_reflects_the_workload() {
    let mut registry = HandlerRegistry::new();
    registry.register_fn("noop", |_args, _kwargs| async move { Ok(json!(null)) });
    let manager = build_manager(test_config(), registry, idle_probe(4));
    manager.start(None).unwrap();

    for i in 0..5 {
        manager
            .submit_task(TaskSpec::new(format!("job-{i}"), "noop"))
            .await
            .unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let stats = manager.get_dashboard_stats().await.unwrap();
        if stats.tasks.total_completed == 5 && stats.tasks.queue_size == 0 {
            assert_eq!(stats.tasks.total_queued, 5);
            assert_eq!(stats.tasks.total_failed, 0);
            assert!(stats.workers.active >= 1);
            assert!(stats.workers.total >= stats.workers.active);
            assert!(stats.workers.max >= stats.performance.recommended_workers);
            assert!(!stats.performance.is_throttling);
            assert_eq!(stats.tasks.recent_by_status.get("completed"), Some(&5));
            break;
        }
        assert!(Instant::now() < deadline, "workload never drained");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    manager.stop().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running redis server at redis://127.0.0.1:6379"]
async fn redis_backend_round_trips_tasks() {
    let namespace = format!("taskmill-test-{}", TaskId::new());
    let queue = RedisQueue::connect(
        "redis://127.0.0.1:6379",
        &namespace,
        Duration::from_secs(60),
    )
    .await
    .expect("redis connection");

    let task = Task::from_spec(TaskSpec::new("wire", "noop").with_priority(TaskPriority::High));
    assert!(queue.put(&task).await.unwrap());
    assert_eq!(queue.size().await.unwrap(), 1);

    let popped = queue.pop().await.unwrap().expect("task back");
    assert_eq!(popped.id, task.id);
    assert_eq!(popped.priority, TaskPriority::High);
    assert!(queue.pop().await.unwrap().is_none());
}
