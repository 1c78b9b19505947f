//! The supervising task manager: owns the queue, the persistence store, the
//! resource monitor, and the worker pool, and runs the autoscaling and
//! metrics loops on named supervisor threads.
//!
//! Scale-down is always graceful: workers are signaled and finish their
//! current task before exiting. Workers that die without being asked are
//! pruned, counted, and reported, never silently replaced mid-task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::ManagerConfig;
use crate::core::monitor::{ResourceMonitor, SystemProbe};
use crate::core::worker::{spawn_worker, SharedCounters, WorkerHandle, WorkerShared};
use crate::core::{HandlerRegistry, SchedulerError, Task, TaskId, TaskSpec, TaskStatus};
use crate::infra::{MetricsSnapshot, PersistenceStore, PriorityTaskQueue, TaskRecord};

/// How long `stop` waits for each worker to finish its current iteration.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Supervisor threads re-check the running flag at this granularity.
const LOOP_SLICE: Duration = Duration::from_millis(250);

/// Host resource readings for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    /// Global CPU usage in percent.
    pub cpu_percent: f64,
    /// Memory usage in percent.
    pub memory_percent: f64,
    /// Available memory in MiB.
    pub memory_available_mb: u64,
    /// Disk usage in percent.
    pub disk_percent: f64,
    /// One-minute load average.
    pub load_avg_1m: f64,
    /// Number of live processes.
    pub process_count: usize,
    /// Recorded monitor samples available for trend inspection.
    pub history_depth: usize,
}

/// Worker-pool state for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    /// Workers currently alive.
    pub active: usize,
    /// All tracked worker handles, alive or still draining a stop signal.
    pub total: usize,
    /// Workers that exited without being asked, since this process started.
    pub dead: usize,
    /// Absolute pool bound.
    pub max: usize,
}

/// Task counts and throughput for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStats {
    /// Tasks waiting in the queue (ready plus delayed).
    pub queue_size: usize,
    /// Tasks submitted since this process started.
    pub total_queued: u64,
    /// Tasks completed since this process started.
    pub total_completed: u64,
    /// Tasks failed since this process started.
    pub total_failed: u64,
    /// Completions per minute over the recent window.
    pub tasks_per_minute: f64,
    /// Average handler wall time in seconds over the recent window.
    pub avg_execution_time: f64,
    /// Counts by status over the recent window.
    pub recent_by_status: HashMap<String, u64>,
}

/// Health figures for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceStats {
    /// Completed as a percentage of all finished tasks; 100 when nothing
    /// has finished yet.
    pub success_rate: f64,
    /// Whether the throttle condition holds right now.
    pub is_throttling: bool,
    /// Worker count the sizing rule currently recommends.
    pub recommended_workers: usize,
    /// Throttle activations since this process started.
    pub throttle_events: u64,
}

/// One consistent snapshot of scheduler state for dashboards and operators.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardStats {
    /// When the snapshot was assembled.
    pub timestamp: DateTime<Utc>,
    /// Host resource readings.
    pub system: SystemStats,
    /// Worker-pool state.
    pub workers: WorkerStats,
    /// Task counts.
    pub tasks: TaskStats,
    /// Throughput figures.
    pub performance: PerformanceStats,
}

/// Supervisor over the queue, the store, the monitor, and the worker pool.
///
/// Construct with [`TaskManager::new`], wrap in an [`Arc`], then call
/// [`start`](TaskManager::start). All submission and query methods are safe
/// to call from any task or thread.
pub struct TaskManager {
    config: ManagerConfig,
    queue: Arc<PriorityTaskQueue>,
    monitor: Arc<ResourceMonitor>,
    registry: Arc<HandlerRegistry>,
    store: Arc<PersistenceStore>,
    counters: Arc<SharedCounters>,
    workers: Mutex<Vec<WorkerHandle>>,
    next_worker_index: AtomicUsize,
    dead_workers: AtomicUsize,
    running: AtomicBool,
    loops: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl TaskManager {
    /// Build a manager from configuration: connect the queue (falling back
    /// to in-process when Redis is unreachable), open the store, and attach
    /// the system resource probe.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidConfig`] when validation fails and
    /// [`SchedulerError::Storage`] when the database cannot be opened.
    pub async fn new(
        config: ManagerConfig,
        registry: HandlerRegistry,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        let queue = Arc::new(PriorityTaskQueue::connect(&config).await);
        let store = Arc::new(match &config.db_path {
            Some(path) => PersistenceStore::open(path)?,
            None => PersistenceStore::in_memory()?,
        });
        let monitor = Arc::new(ResourceMonitor::new(Arc::new(SystemProbe::new()), &config));
        Ok(Self::with_parts(config, queue, monitor, registry, store))
    }

    /// Assemble a manager from pre-built parts. The composition seam for
    /// tests and embedders that supply their own probe, queue, or store.
    #[must_use]
    pub fn with_parts(
        config: ManagerConfig,
        queue: Arc<PriorityTaskQueue>,
        monitor: Arc<ResourceMonitor>,
        registry: HandlerRegistry,
        store: Arc<PersistenceStore>,
    ) -> Self {
        Self {
            config,
            queue,
            monitor,
            registry: Arc::new(registry),
            store,
            counters: Arc::new(SharedCounters::default()),
            workers: Mutex::new(Vec::new()),
            next_worker_index: AtomicUsize::new(0),
            dead_workers: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool and the autoscaling and metrics loops. When
    /// `num_workers` is `None`, the initial size comes from the resource
    /// monitor's recommendation; an explicit count is still clamped to
    /// `[1, max_workers]`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::AlreadyRunning`] when already started.
    pub fn start(self: &Arc<Self>, num_workers: Option<usize>) -> Result<(), SchedulerError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let initial = num_workers
            .unwrap_or_else(|| self.monitor.recommended_worker_count())
            .clamp(1, self.config.max_workers);
        info!(
            workers = initial,
            fallback_queue = self.queue.is_fallback(),
            handlers = self.registry.len(),
            "starting task manager"
        );

        {
            let mut workers = self.workers.lock();
            for _ in 0..initial {
                let index = self.next_worker_index.fetch_add(1, Ordering::Relaxed);
                workers.push(spawn_worker(index, self.worker_shared()));
            }
        }

        let mut loops = self.loops.lock();
        loops.push(spawn_supervisor_thread(
            "tm-autoscale",
            self.config.autoscale_interval,
            Arc::downgrade(self),
            |manager| manager.resize_pool(),
        ));
        loops.push(spawn_metrics_thread(
            self.config.metrics_interval,
            Arc::downgrade(self),
        ));
        Ok(())
    }

    /// Signal every worker, stop the supervisor loops, and join workers
    /// with a bounded per-worker timeout. In-flight tasks finish; workers
    /// that exceed the timeout are detached.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotRunning`] when not started.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Err(SchedulerError::NotRunning);
        }
        info!("stopping task manager");

        let loops: Vec<thread::JoinHandle<()>> = std::mem::take(&mut *self.loops.lock());
        let workers: Vec<WorkerHandle> = std::mem::take(&mut *self.workers.lock());
        for worker in &workers {
            worker.signal_stop();
        }
        let joined = tokio::task::spawn_blocking(move || {
            for handle in loops {
                let _ = handle.join();
            }
            for worker in workers {
                worker.join_timeout(JOIN_TIMEOUT);
            }
        })
        .await;
        if let Err(e) = joined {
            warn!(error = %e, "shutdown join task failed");
        }
        info!("task manager stopped");
        Ok(())
    }

    /// Whether the manager is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The configuration this manager runs with.
    #[must_use]
    pub const fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Workers currently alive.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.workers.lock().iter().filter(|w| w.is_alive()).count()
    }

    /// All tracked worker handles, alive or still draining a stop signal.
    #[must_use]
    pub fn total_workers(&self) -> usize {
        self.workers.lock().len()
    }

    /// Validate a submission spec, persist the task as queued, and enqueue
    /// it. Returns the generated task id.
    ///
    /// The function name is not checked against the registry here: shared
    /// queues may be drained by a process with a different handler set. An
    /// unresolvable name fails at execution time instead, without retry.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidSubmission`] for an empty name or
    /// function, and propagates queue and storage failures. A task whose
    /// enqueue fails is not silently dropped; the error surfaces here.
    pub async fn submit_task(&self, spec: TaskSpec) -> Result<TaskId, SchedulerError> {
        if spec.name.trim().is_empty() {
            return Err(SchedulerError::InvalidSubmission(
                "task name must not be empty".into(),
            ));
        }
        if spec.function.trim().is_empty() {
            return Err(SchedulerError::InvalidSubmission(
                "task function must not be empty".into(),
            ));
        }

        let mut task = Task::from_spec(spec);
        task.status = TaskStatus::Queued;

        // Persist before enqueue so a fast worker's status updates are
        // never overwritten by the submission record.
        self.store.upsert_task(&task)?;
        match self.queue.put(&task).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(SchedulerError::QueueUnavailable(
                    "queue refused the task".into(),
                ))
            }
            Err(e) => return Err(e),
        }

        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        info!(
            task_id = %task.id,
            function = %task.function,
            priority = %task.priority,
            "task submitted"
        );
        Ok(task.id)
    }

    /// Read a task's durable record.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn get_task_status(&self, id: &TaskId) -> Result<Option<TaskRecord>, SchedulerError> {
        self.store.get_task(id)
    }

    /// Read a task's result: the queue's transient cache first, then the
    /// durable record.
    ///
    /// # Errors
    ///
    /// Propagates queue and storage failures.
    pub async fn get_result(&self, id: &TaskId) -> Result<Option<Value>, SchedulerError> {
        if let Some(value) = self.queue.get_result(id).await? {
            return Ok(Some(value));
        }
        Ok(self.store.get_task(id)?.and_then(|record| record.result))
    }

    /// Cancel a still-queued task. Returns `true` when the task was removed
    /// from the queue before any worker dequeued it; a running or finished
    /// task is untouched and yields `false`.
    ///
    /// # Errors
    ///
    /// Propagates queue and storage failures.
    pub async fn cancel_task(&self, id: &TaskId) -> Result<bool, SchedulerError> {
        let removed = self.queue.remove(id).await?;
        if removed {
            self.store.mark_cancelled(id)?;
            info!(task_id = %id, "task cancelled");
        }
        Ok(removed)
    }

    /// Assemble a dashboard snapshot: host resources, pool state, task
    /// counts, and throughput over the configured window.
    ///
    /// # Errors
    ///
    /// Propagates queue and storage failures.
    pub async fn get_dashboard_stats(&self) -> Result<DashboardStats, SchedulerError> {
        let sample = self.monitor.sample();
        let queued = self.queue.size().await?;
        let window = self.config.stats_window;
        let status_counts = self.store.recent_status_counts(window)?;
        let completed_recent = self.store.recent_completed_count(window)?;
        let window_minutes = window.as_secs_f64() / 60.0;
        let tasks_per_minute = if window_minutes > 0.0 {
            completed_recent as f64 / window_minutes
        } else {
            0.0
        };

        let completed = self.counters.completed.load(Ordering::Relaxed);
        let failed = self.counters.failed.load(Ordering::Relaxed);
        let finished = completed + failed;
        let success_rate = if finished == 0 {
            100.0
        } else {
            completed as f64 / finished as f64 * 100.0
        };

        Ok(DashboardStats {
            timestamp: Utc::now(),
            system: SystemStats {
                cpu_percent: sample.cpu_percent,
                memory_percent: sample.memory_percent,
                memory_available_mb: sample.memory_available_mb,
                disk_percent: sample.disk_percent,
                load_avg_1m: sample.load_avg_1m,
                process_count: sample.process_count,
                history_depth: self.monitor.history_depth(),
            },
            workers: WorkerStats {
                active: self.active_workers(),
                total: self.total_workers(),
                dead: self.dead_worker_count(),
                max: self.config.max_workers,
            },
            tasks: TaskStats {
                queue_size: queued,
                total_queued: self.counters.submitted.load(Ordering::Relaxed),
                total_completed: completed,
                total_failed: failed,
                tasks_per_minute,
                avg_execution_time: self.store.recent_avg_execution_time(window)?,
                recent_by_status: status_counts,
            },
            performance: PerformanceStats {
                success_rate,
                is_throttling: self.monitor.should_throttle(),
                recommended_workers: self
                    .monitor
                    .recommended_worker_count()
                    .min(self.config.max_workers),
                throttle_events: self.counters.throttle_events.load(Ordering::Relaxed),
            },
        })
    }

    fn dead_worker_count(&self) -> usize {
        let unpruned = self
            .workers
            .lock()
            .iter()
            .filter(|w| !w.is_alive() && !w.stop_requested())
            .count();
        self.dead_workers.load(Ordering::Relaxed) + unpruned
    }

    fn worker_shared(&self) -> Arc<WorkerShared> {
        Arc::new(WorkerShared {
            queue: Arc::clone(&self.queue),
            monitor: Arc::clone(&self.monitor),
            registry: Arc::clone(&self.registry),
            store: Arc::clone(&self.store),
            counters: Arc::clone(&self.counters),
            poll_timeout: self.config.poll_timeout,
            throttle_pause: self.config.throttle_pause,
            retry_backoff: self.config.retry_backoff,
            result_ttl: self.config.result_ttl,
        })
    }

    /// One autoscale step: record a sample, prune exited workers, then grow
    /// or shrink toward the monitor's recommendation within the bound.
    fn resize_pool(&self) {
        self.monitor.record();
        let target = self
            .monitor
            .recommended_worker_count()
            .min(self.config.max_workers);
        let mut workers = self.workers.lock();
        // `stop` flips the flag before draining the pool; checking under
        // the lock ensures no worker is spawned into a drained pool.
        if !self.running.load(Ordering::Acquire) {
            return;
        }

        workers.retain(|worker| {
            if worker.is_alive() {
                return true;
            }
            if !worker.stop_requested() {
                self.dead_workers.fetch_add(1, Ordering::Relaxed);
                warn!(worker_id = %worker.worker_id, "worker exited unexpectedly");
            }
            false
        });

        // Stop-signaled workers are still draining their current task and
        // no longer count as capacity.
        let live = workers
            .iter()
            .filter(|worker| !worker.stop_requested())
            .count();

        if live < target {
            let adding = target - live;
            info!(live, target, adding, "scaling worker pool up");
            for _ in 0..adding {
                let index = self.next_worker_index.fetch_add(1, Ordering::Relaxed);
                workers.push(spawn_worker(index, self.worker_shared()));
            }
        } else if live > target {
            let removing = live - target;
            info!(live, target, removing, "scaling worker pool down");
            // Most recently started first, so the longest-running workers
            // keep draining the queue.
            let mut signaled = 0;
            for worker in workers.iter().rev() {
                if signaled == removing {
                    break;
                }
                if !worker.stop_requested() {
                    worker.signal_stop();
                    signaled += 1;
                }
            }
        }
    }

    async fn collect_metrics(&self) {
        let sample = self.monitor.record();
        let queue_size = match self.queue.size().await {
            Ok(size) => size,
            Err(e) => {
                warn!(error = %e, "queue size unavailable for metrics");
                0
            }
        };
        let window = self.config.stats_window;
        let tasks_per_minute = match self.store.recent_completed_count(window) {
            Ok(count) => count as f64 / (window.as_secs_f64() / 60.0),
            Err(e) => {
                warn!(error = %e, "throughput unavailable for metrics");
                0.0
            }
        };
        let snapshot = MetricsSnapshot {
            timestamp: sample.timestamp,
            cpu_percent: sample.cpu_percent,
            memory_percent: sample.memory_percent,
            active_workers: self.active_workers(),
            queue_size,
            tasks_per_minute,
        };
        if let Err(e) = self.store.insert_metrics(&snapshot) {
            warn!(error = %e, "failed to persist metrics snapshot");
        }
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        // Signal without joining: leaked workers must not block process
        // teardown. Supervisor threads hold only weak references and exit
        // on their next slice.
        if self.running.swap(false, Ordering::AcqRel) {
            for worker in self.workers.get_mut().iter() {
                worker.signal_stop();
            }
        }
    }
}

/// Run `step` every `period` on a named supervisor thread, re-checking the
/// running flag each slice. The thread holds only a weak reference so a
/// dropped manager never leaks its loops.
fn spawn_supervisor_thread<F>(
    name: &str,
    period: Duration,
    weak: Weak<TaskManager>,
    step: F,
) -> thread::JoinHandle<()>
where
    F: Fn(&TaskManager) + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let slice = LOOP_SLICE.min(period);
            let mut elapsed = Duration::ZERO;
            loop {
                thread::sleep(slice);
                let Some(manager) = weak.upgrade() else { return };
                if !manager.running.load(Ordering::Acquire) {
                    return;
                }
                elapsed += slice;
                if elapsed >= period {
                    elapsed = Duration::ZERO;
                    step(&manager);
                }
            }
        })
        .expect("failed to spawn supervisor thread")
}

/// Metrics variant: owns a current-thread runtime for the async queue-depth
/// read.
fn spawn_metrics_thread(period: Duration, weak: Weak<TaskManager>) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("tm-metrics".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!(error = %e, "failed to build metrics runtime");
                    return;
                }
            };
            let slice = LOOP_SLICE.min(period);
            let mut elapsed = Duration::ZERO;
            loop {
                thread::sleep(slice);
                let Some(manager) = weak.upgrade() else { return };
                if !manager.running.load(Ordering::Acquire) {
                    return;
                }
                elapsed += slice;
                if elapsed >= period {
                    elapsed = Duration::ZERO;
                    rt.block_on(manager.collect_metrics());
                }
            }
        })
        .expect("failed to spawn metrics thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::monitor::StaticProbe;
    use crate::core::TaskPriority;
    use serde_json::json;
    use std::time::Instant;

    fn quiet_config() -> ManagerConfig {
        ManagerConfig::default()
            .with_in_memory_store()
            .with_poll_timeout(Duration::from_millis(100))
            .with_retry_backoff(Duration::from_millis(50))
    }

    fn build_manager(config: ManagerConfig, registry: HandlerRegistry) -> Arc<TaskManager> {
        let probe = Arc::new(StaticProbe {
            cpu_percent: 10.0,
            memory_percent: 10.0,
            cores: 3,
        });
        let monitor = Arc::new(ResourceMonitor::new(probe, &config));
        let queue = Arc::new(PriorityTaskQueue::in_memory());
        let store = Arc::new(PersistenceStore::in_memory().unwrap());
        Arc::new(TaskManager::with_parts(
            config, queue, monitor, registry, store,
        ))
    }

    async fn wait_for_terminal(manager: &TaskManager, id: &TaskId) -> TaskRecord {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(record) = manager.get_task_status(id).unwrap() {
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
    async fn submit_runs_to_completion() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("echo", |args, _kwargs| async move {
            Ok(args.into_iter().next().unwrap_or(Value::Null))
        });
        let manager = build_manager(quiet_config(), registry);
        manager.start(None).unwrap();

        let id = manager
            .submit_task(
                TaskSpec::new("echo-demo", "echo")
                    .with_args(vec![json!({"payload": 7})])
                    .with_priority(TaskPriority::Critical),
            )
            .await
            .unwrap();

        let record = wait_for_terminal(&manager, &id).await;
        assert_eq!(record.status, TaskStatus::Completed);
        assert!(record.worker_id.is_some());
        assert!(record.execution_time.is_some());
        assert_eq!(
            manager.get_result(&id).await.unwrap(),
            Some(json!({"payload": 7}))
        );

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn explicit_worker_count_is_honored() {
        let manager = build_manager(quiet_config(), HandlerRegistry::new());
        manager.start(Some(1)).unwrap();
        assert_eq!(manager.active_workers(), 1);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("always_fail", |_args, _kwargs| async move {
            Err(anyhow::anyhow!("simulated outage"))
        });
        let manager = build_manager(quiet_config(), registry);
        manager.start(None).unwrap();

        let id = manager
            .submit_task(
                TaskSpec::new("doomed", "always_fail")
                    .with_priority(TaskPriority::Low)
                    .with_max_retries(2),
            )
            .await
            .unwrap();

        let record = wait_for_terminal(&manager, &id).await;
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.retry_count, 2);
        assert!(record.error.is_some());

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_handler_fails_without_retry() {
        let manager = build_manager(quiet_config(), HandlerRegistry::new());
        manager.start(None).unwrap();

        let id = manager
            .submit_task(TaskSpec::new("nowhere", "missing_function"))
            .await
            .unwrap();

        let record = wait_for_terminal(&manager, &id).await;
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.retry_count, 0);

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_before_dequeue() {
        // Never started: no worker can race the cancellation.
        let manager = build_manager(quiet_config(), HandlerRegistry::new());
        let id = manager
            .submit_task(TaskSpec::new("parked", "noop"))
            .await
            .unwrap();

        assert!(manager.cancel_task(&id).await.unwrap());
        let record = manager.get_task_status(&id).unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Cancelled);

        // Already removed; a second cancel is a no-op.
        assert!(!manager.cancel_task(&id).await.unwrap());
    }

    #[tokio::test]
    async fn start_and_stop_guard_state() {
        let manager = build_manager(quiet_config(), HandlerRegistry::new());
        assert!(matches!(
            manager.stop().await,
            Err(SchedulerError::NotRunning)
        ));

        manager.start(None).unwrap();
        assert!(manager.is_running());
        assert!(matches!(
            manager.start(None),
            Err(SchedulerError::AlreadyRunning)
        ));

        manager.stop().await.unwrap();
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn dashboard_snapshot_has_the_documented_shape() {
        let manager = build_manager(quiet_config(), HandlerRegistry::new());
        manager.start(Some(2)).unwrap();

        let stats = manager.get_dashboard_stats().await.unwrap();
        let value = serde_json::to_value(&stats).unwrap();
        for path in [
            "/system/cpu_percent",
            "/system/history_depth",
            "/workers/active",
            "/workers/total",
            "/workers/dead",
            "/workers/max",
            "/tasks/queue_size",
            "/tasks/total_queued",
            "/tasks/total_completed",
            "/tasks/total_failed",
            "/tasks/tasks_per_minute",
            "/tasks/avg_execution_time",
            "/tasks/recent_by_status",
            "/performance/success_rate",
            "/performance/is_throttling",
            "/performance/recommended_workers",
            "/performance/throttle_events",
        ] {
            assert!(
                value.pointer(path).is_some(),
                "dashboard snapshot missing {path}"
            );
        }
        assert_eq!(value.pointer("/workers/total"), Some(&json!(2)));
        assert_eq!(value.pointer("/performance/is_throttling"), Some(&json!(false)));

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn retry_record_lands_before_requeue() {
        // One transient failure, then success. Zero backoff makes the retry
        // immediately eligible, so a stale status write after the requeue
        // would overwrite the second attempt's outcome.
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&attempts);
        let mut registry = HandlerRegistry::new();
        registry.register_fn("flaky", move |_args, _kwargs| {
            let attempt = seen.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(anyhow::anyhow!("transient outage"))
                } else {
                    Ok(json!("recovered"))
                }
            }
        });
        let config = quiet_config().with_retry_backoff(Duration::ZERO);
        let manager = build_manager(config, registry);
        manager.start(Some(2)).unwrap();

        let id = manager
            .submit_task(TaskSpec::new("flaky-job", "flaky").with_max_retries(1))
            .await
            .unwrap();

        let record = wait_for_terminal(&manager, &id).await;
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.retry_count, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        // The durable record must stay completed; no late write may demote
        // it back to the retry status.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let record = manager.get_task_status(&id).unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_prompt_under_a_long_poll_timeout() {
        // Default poll timeout; workers must still observe the stop signal
        // between short queue waits instead of blocking a full poll.
        let config = ManagerConfig::default().with_in_memory_store();
        let manager = build_manager(config, HandlerRegistry::new());
        manager.start(Some(2)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let begun = Instant::now();
        manager.stop().await.unwrap();
        assert!(
            begun.elapsed() < Duration::from_secs(2),
            "stop took {:?}",
            begun.elapsed()
        );
        assert_eq!(manager.active_workers(), 0);
    }

    #[tokio::test]
    async fn empty_submissions_are_rejected() {
        let manager = build_manager(quiet_config(), HandlerRegistry::new());
        assert!(matches!(
            manager.submit_task(TaskSpec::new("", "noop")).await,
            Err(SchedulerError::InvalidSubmission(_))
        ));
        assert!(matches!(
            manager.submit_task(TaskSpec::new("named", "  ")).await,
            Err(SchedulerError::InvalidSubmission(_))
        ));
    }
}
