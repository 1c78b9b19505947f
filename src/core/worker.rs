//! Worker execution loop: one dedicated OS thread per worker, each owning a
//! single-threaded tokio runtime.
//!
//! The loop is the system's backpressure point: when the resource monitor
//! says to throttle, workers idle without dequeuing, so queue depth grows
//! instead of host load. Handler failures, panics, and timeouts are isolated
//! per task and never crash the loop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::core::monitor::ResourceMonitor;
use crate::core::task::{Task, TaskPriority, TaskStatus};
use crate::core::{HandlerRegistry, SchedulerError};
use crate::infra::{PersistenceStore, PriorityTaskQueue};

/// Dequeue waits are chopped into slices of this length so a stop signal is
/// observed promptly even under a long poll timeout.
const STOP_CHECK_SLICE: Duration = Duration::from_millis(250);

/// Cross-worker counters backing the dashboard totals.
#[derive(Debug, Default)]
pub(crate) struct SharedCounters {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub throttle_events: AtomicU64,
}

/// Everything a worker needs, shared across the pool.
pub(crate) struct WorkerShared {
    pub queue: Arc<PriorityTaskQueue>,
    pub monitor: Arc<ResourceMonitor>,
    pub registry: Arc<HandlerRegistry>,
    pub store: Arc<PersistenceStore>,
    pub counters: Arc<SharedCounters>,
    pub poll_timeout: Duration,
    pub throttle_pause: Duration,
    pub retry_backoff: Duration,
    pub result_ttl: Duration,
}

/// Handle to a spawned worker thread.
pub(crate) struct WorkerHandle {
    pub worker_id: String,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl WorkerHandle {
    /// Ask the worker to exit after its current iteration. Never interrupts
    /// an in-flight task.
    pub fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Whether the worker was asked to stop.
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Whether the worker thread is still running.
    pub fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Join with a bounded timeout via a helper thread; workers that do not
    /// exit in time are detached rather than blocking shutdown.
    pub fn join_timeout(self, timeout: Duration) {
        let worker_id = self.worker_id;
        let (tx, rx) = std::sync::mpsc::channel();
        let joiner = thread::spawn(move || {
            let clean = self.handle.join().is_ok();
            let _ = tx.send(clean);
        });
        match rx.recv_timeout(timeout) {
            Ok(true) => {
                debug!(worker_id = %worker_id, "worker joined");
                let _ = joiner.join();
            }
            Ok(false) => {
                warn!(worker_id = %worker_id, "worker thread panicked");
                let _ = joiner.join();
            }
            Err(_) => {
                warn!(worker_id = %worker_id, "worker did not exit within timeout, detaching");
            }
        }
    }
}

/// Spawn a worker thread named `tm-worker-{index}` running the poll loop on
/// its own current-thread tokio runtime.
pub(crate) fn spawn_worker(index: usize, shared: Arc<WorkerShared>) -> WorkerHandle {
    let worker_id = format!("worker-{index}");
    let stop = Arc::new(AtomicBool::new(false));
    let handle = thread::Builder::new()
        .name(format!("tm-worker-{index}"))
        .spawn({
            let worker_id = worker_id.clone();
            let stop = Arc::clone(&stop);
            move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(worker_id = %worker_id, error = %e, "failed to build worker runtime");
                        return;
                    }
                };
                let mut worker = Worker {
                    id: worker_id,
                    shared,
                    stop,
                    processed: 0,
                    failed: 0,
                };
                rt.block_on(worker.run());
            }
        })
        .expect("failed to spawn worker thread");

    WorkerHandle {
        worker_id,
        stop,
        handle,
    }
}

struct Worker {
    id: String,
    shared: Arc<WorkerShared>,
    stop: Arc<AtomicBool>,
    processed: u64,
    failed: u64,
}

impl Worker {
    async fn run(&mut self) {
        info!(worker_id = %self.id, "worker started");

        while !self.stop.load(Ordering::Acquire) {
            if self.shared.monitor.should_throttle() {
                self.shared
                    .counters
                    .throttle_events
                    .fetch_add(1, Ordering::Relaxed);
                warn!(worker_id = %self.id, "throttling due to high resource usage");
                tokio::time::sleep(self.shared.throttle_pause).await;
                continue;
            }

            match self.next_task().await {
                Ok(Some(task)) => self.process(task).await,
                Ok(None) => {}
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "dequeue failed, backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!(
            worker_id = %self.id,
            processed = self.processed,
            failed = self.failed,
            "worker stopped"
        );
    }

    /// Wait up to the poll timeout for the next task, re-checking the stop
    /// flag between short queue waits so shutdown never blocks on an idle
    /// queue.
    async fn next_task(&self) -> Result<Option<Task>, SchedulerError> {
        let deadline = Instant::now() + self.shared.poll_timeout;
        loop {
            if self.stop.load(Ordering::Acquire) {
                return Ok(None);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if let Some(task) = self.shared.queue.get(remaining.min(STOP_CHECK_SLICE)).await? {
                return Ok(Some(task));
            }
        }
    }

    async fn process(&mut self, mut task: Task) {
        task.status = TaskStatus::Running;
        task.worker_id = Some(self.id.clone());
        self.persist(&task);

        debug!(
            worker_id = %self.id,
            task_id = %task.id,
            function = %task.function,
            priority = %task.priority,
            "executing task"
        );

        let handler = match self.shared.registry.resolve(&task.function) {
            Ok(handler) => handler,
            Err(e) => {
                // Configuration error, not a transient one: terminal, no retry.
                task.status = TaskStatus::Failed;
                task.error = Some(e.to_string());
                self.shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.failed += 1;
                error!(worker_id = %self.id, task_id = %task.id, error = %e, "task failed");
                self.persist(&task);
                return;
            }
        };

        if matches!(task.priority, TaskPriority::Low | TaskPriority::Batch) {
            // Cooperative hint: background tiers give other work a turn first.
            tokio::task::yield_now().await;
        }

        let started = Instant::now();
        let args = task.args.clone();
        let kwargs = task.kwargs.clone();
        let join = tokio::spawn(async move { handler.execute(args, kwargs).await });
        let abort = join.abort_handle();

        let outcome = match tokio::time::timeout(task.timeout, join).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(format!("{e:#}")),
            Ok(Err(join_err)) => Err(if join_err.is_panic() {
                let payload = join_err.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "opaque panic payload".into());
                format!("handler panicked: {message}")
            } else {
                "handler task aborted".to_string()
            }),
            Err(_) => {
                abort.abort();
                Err(format!("timed out after {:?}", task.timeout))
            }
        };
        task.execution_time = Some(started.elapsed().as_secs_f64());

        match outcome {
            Ok(value) => self.complete(&mut task, value).await,
            Err(message) => self.fail_or_retry(&mut task, message).await,
        }
    }

    async fn complete(&mut self, task: &mut Task, value: serde_json::Value) {
        task.status = TaskStatus::Completed;
        task.error = None;
        task.result = Some(value.clone());
        self.persist(task);

        if let Err(e) = self
            .shared
            .queue
            .set_result(&task.id, &value, self.shared.result_ttl)
            .await
        {
            warn!(worker_id = %self.id, task_id = %task.id, error = %e, "failed to cache result");
        }

        self.shared
            .counters
            .completed
            .fetch_add(1, Ordering::Relaxed);
        self.processed += 1;
        info!(
            worker_id = %self.id,
            task_id = %task.id,
            execution_time = task.execution_time,
            "task completed"
        );
    }

    async fn fail_or_retry(&mut self, task: &mut Task, message: String) {
        task.error = Some(message.clone());

        if task.retry_count < task.max_retries {
            task.retry_count += 1;
            task.status = TaskStatus::Retry;
            let backoff = self.shared.retry_backoff * task.retry_count;
            let delay = chrono::Duration::from_std(backoff)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
            task.scheduled_time = Some(Utc::now() + delay);

            // Persist the retry record before re-enqueuing: with a short
            // backoff another worker may pick the task up immediately, and
            // its updates must not be overwritten by this record.
            self.persist(task);
            match self.shared.queue.put(task).await {
                Ok(true) => {
                    info!(
                        worker_id = %self.id,
                        task_id = %task.id,
                        retry = task.retry_count,
                        max_retries = task.max_retries,
                        backoff_secs = backoff.as_secs_f64(),
                        error = %message,
                        "task scheduled for retry"
                    );
                    return;
                }
                Ok(false) => {
                    error!(worker_id = %self.id, task_id = %task.id, "queue refused retry");
                }
                Err(e) => {
                    error!(worker_id = %self.id, task_id = %task.id, error = %e, "retry enqueue failed");
                }
            }
        }

        task.status = TaskStatus::Failed;
        self.persist(task);
        self.shared.counters.failed.fetch_add(1, Ordering::Relaxed);
        self.failed += 1;
        error!(
            worker_id = %self.id,
            task_id = %task.id,
            retry_count = task.retry_count,
            error = %message,
            "task failed"
        );
    }

    fn persist(&self, task: &Task) {
        if let Err(e) = self.shared.store.upsert_task(task) {
            error!(
                worker_id = %self.id,
                task_id = %task.id,
                error = %e,
                "failed to persist task record"
            );
        }
    }
}
