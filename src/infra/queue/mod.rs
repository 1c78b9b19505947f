//! The shared priority task queue: a facade over pluggable backends.
//!
//! The Redis backend is the multi-consumer path; the in-process memory
//! backend is a single-process fallback selected when Redis is unreachable
//! or unconfigured. Falling back is a durability and scale regression, not a
//! drop-in replacement, and is logged as such at connect time.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::ManagerConfig;
use crate::core::{SchedulerError, Task, TaskId};

pub use self::memory::MemoryQueue;
pub use self::redis::RedisQueue;

/// Upper bound on a single empty-queue wait slice, so delayed-task
/// promotion and stop flags are observed promptly.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Storage behind [`PriorityTaskQueue`].
///
/// Implementations must provide an atomic pop: under concurrent consumers,
/// at most one receives any given task.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Store the task and index it by score; tasks with a future
    /// `scheduled_time` enter a delayed index instead. `Ok(false)` means
    /// the backend refused the task.
    async fn put(&self, task: &Task) -> Result<bool, SchedulerError>;

    /// Promote due delayed tasks, then atomically remove and return the
    /// lowest-score ready entry, if any.
    async fn pop(&self) -> Result<Option<Task>, SchedulerError>;

    /// Count of not-yet-dequeued tasks (ready plus delayed).
    async fn size(&self) -> Result<usize, SchedulerError>;

    /// Drop a still-queued task and its payload; `Ok(false)` once dequeued.
    async fn remove(&self, id: &TaskId) -> Result<bool, SchedulerError>;

    /// Cache a task result under a TTL, separate from the durable store.
    async fn set_result(
        &self,
        id: &TaskId,
        value: &Value,
        ttl: Duration,
    ) -> Result<(), SchedulerError>;

    /// Read a cached result, if present and unexpired.
    async fn get_result(&self, id: &TaskId) -> Result<Option<Value>, SchedulerError>;

    /// Wait until a task may be available, up to `timeout`. The default is
    /// a bounded sleep; backends with in-process signaling override it.
    async fn wait_for_task(&self, timeout: Duration) {
        tokio::time::sleep(timeout.min(POLL_INTERVAL)).await;
    }
}

/// Shared, priority-ordered task queue with per-task result storage.
pub struct PriorityTaskQueue {
    backend: Box<dyn QueueBackend>,
    fallback: bool,
}

impl PriorityTaskQueue {
    /// Connect to the configured backend. Tries Redis when a URL is
    /// configured; on any connection failure, logs the degradation and
    /// falls back to the in-process queue.
    pub async fn connect(config: &ManagerConfig) -> Self {
        if let Some(url) = &config.redis_url {
            match RedisQueue::connect(url, &config.queue_namespace, config.payload_ttl).await {
                Ok(backend) => {
                    info!(namespace = %config.queue_namespace, "connected to redis task queue");
                    return Self {
                        backend: Box::new(backend),
                        fallback: false,
                    };
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        "redis connection failed; falling back to the in-process queue \
                         (single process only, tasks do not survive restarts)"
                    );
                }
            }
        }
        Self::in_memory()
    }

    /// Build the in-process fallback queue directly (tests, brokerless
    /// deployments).
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            backend: Box::new(MemoryQueue::new()),
            fallback: true,
        }
    }

    /// Whether the in-process fallback is active.
    #[must_use]
    pub const fn is_fallback(&self) -> bool {
        self.fallback
    }

    /// Store the task and insert it into the priority index. Within a
    /// priority tier, earlier submissions are dequeued first.
    ///
    /// # Errors
    ///
    /// Propagates backend failures; `Ok(false)` means the backend refused
    /// the task without failing.
    pub async fn put(&self, task: &Task) -> Result<bool, SchedulerError> {
        self.backend.put(task).await
    }

    /// Remove and return the highest-priority eligible task, blocking up to
    /// `timeout` while the queue is empty. Safe under concurrent callers:
    /// no two receive the same task.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn get(&self, timeout: Duration) -> Result<Option<Task>, SchedulerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(task) = self.backend.pop().await? {
                return Ok(Some(task));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.backend.wait_for_task(deadline - now).await;
        }
    }

    /// Current count of not-yet-dequeued tasks.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn size(&self) -> Result<usize, SchedulerError> {
        self.backend.size().await
    }

    /// Drop a still-queued task; `Ok(false)` if it was already dequeued.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn remove(&self, id: &TaskId) -> Result<bool, SchedulerError> {
        self.backend.remove(id).await
    }

    /// Cache a task result under a TTL. This cache is a short-lived
    /// convenience layer; the persistence store stays authoritative.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn set_result(
        &self,
        id: &TaskId,
        value: &Value,
        ttl: Duration,
    ) -> Result<(), SchedulerError> {
        self.backend.set_result(id, value, ttl).await
    }

    /// Read a cached result, if present and unexpired.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn get_result(&self, id: &TaskId) -> Result<Option<Value>, SchedulerError> {
        self.backend.get_result(id).await
    }
}
