//! In-process fallback queue: a priority heap plus a delayed list.
//!
//! Single process only. Tasks do not survive restarts and cannot be shared
//! with other consumers; selecting this backend is a deliberate degradation
//! over the Redis path, logged at connect time.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::core::{SchedulerError, Task, TaskId};
use crate::util::clock;

use super::{QueueBackend, POLL_INTERVAL};

/// Heap entry ordered by score: priority tier first, then submission order
/// within the tier (FIFO via a monotone sequence number).
struct ReadyEntry {
    priority: u8,
    seq: u64,
    task: Task,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.task.id == other.task.id
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the lowest (priority, seq)
        // pops first.
        match other.priority.cmp(&self.priority) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ordering => ordering,
        }
    }
}

#[derive(Default)]
struct MemoryState {
    ready: BinaryHeap<ReadyEntry>,
    delayed: Vec<Task>,
    results: HashMap<String, (Value, Instant)>,
    next_seq: u64,
}

impl MemoryState {
    fn push_ready(&mut self, task: Task) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ready.push(ReadyEntry {
            priority: task.priority.value(),
            seq,
            task,
        });
    }

    /// Move due delayed tasks into the ready heap.
    fn promote_due(&mut self) {
        let now_ms = clock::now_ms();
        let mut index = 0;
        while index < self.delayed.len() {
            let due = self.delayed[index]
                .eligible_at_ms()
                .is_none_or(|at| at <= now_ms);
            if due {
                let task = self.delayed.swap_remove(index);
                self.push_ready(task);
            } else {
                index += 1;
            }
        }
    }

    fn purge_expired_results(&mut self) {
        let now = Instant::now();
        self.results.retain(|_, (_, expires)| *expires > now);
    }
}

/// In-process priority queue with delayed-task support and a TTL'd result
/// cache.
pub struct MemoryQueue {
    state: Mutex<MemoryState>,
    notify: Notify,
}

impl MemoryQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            notify: Notify::new(),
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn put(&self, task: &Task) -> Result<bool, SchedulerError> {
        let now_ms = clock::now_ms();
        let mut state = self.state.lock();
        if task.eligible_at_ms().is_some_and(|at| at > now_ms) {
            state.delayed.push(task.clone());
        } else {
            state.push_ready(task.clone());
        }
        drop(state);
        self.notify.notify_one();
        Ok(true)
    }

    async fn pop(&self) -> Result<Option<Task>, SchedulerError> {
        let mut state = self.state.lock();
        state.promote_due();
        Ok(state.ready.pop().map(|entry| entry.task))
    }

    async fn size(&self) -> Result<usize, SchedulerError> {
        let mut state = self.state.lock();
        state.promote_due();
        Ok(state.ready.len() + state.delayed.len())
    }

    async fn remove(&self, id: &TaskId) -> Result<bool, SchedulerError> {
        let mut state = self.state.lock();
        let ready_before = state.ready.len();
        let entries: Vec<ReadyEntry> = state.ready.drain().collect();
        state.ready = entries
            .into_iter()
            .filter(|entry| entry.task.id != *id)
            .collect();
        let removed_ready = state.ready.len() < ready_before;

        let delayed_before = state.delayed.len();
        state.delayed.retain(|task| task.id != *id);
        let removed_delayed = state.delayed.len() < delayed_before;

        Ok(removed_ready || removed_delayed)
    }

    async fn set_result(
        &self,
        id: &TaskId,
        value: &Value,
        ttl: Duration,
    ) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        state.purge_expired_results();
        state
            .results
            .insert(id.to_string(), (value.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn get_result(&self, id: &TaskId) -> Result<Option<Value>, SchedulerError> {
        let mut state = self.state.lock();
        state.purge_expired_results();
        Ok(state.results.get(&id.to_string()).map(|(v, _)| v.clone()))
    }

    async fn wait_for_task(&self, timeout: Duration) {
        // Capped so delayed-task promotion stays responsive even when no
        // put arrives to fire the notification.
        let _ = tokio::time::timeout(timeout.min(POLL_INTERVAL), self.notify.notified()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{TaskPriority, TaskSpec};
    use chrono::Utc;

    fn make_task(name: &str, priority: TaskPriority) -> Task {
        Task::from_spec(TaskSpec::new(name, "noop").with_priority(priority))
    }

    #[tokio::test]
    async fn priority_ordering() {
        let q = MemoryQueue::new();
        q.put(&make_task("low", TaskPriority::Low)).await.unwrap();
        q.put(&make_task("critical", TaskPriority::Critical))
            .await
            .unwrap();
        q.put(&make_task("medium", TaskPriority::Medium))
            .await
            .unwrap();
        q.put(&make_task("batch", TaskPriority::Batch)).await.unwrap();

        assert_eq!(q.pop().await.unwrap().unwrap().name, "critical");
        assert_eq!(q.pop().await.unwrap().unwrap().name, "medium");
        assert_eq!(q.pop().await.unwrap().unwrap().name, "low");
        assert_eq!(q.pop().await.unwrap().unwrap().name, "batch");
        assert!(q.pop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fifo_within_a_tier() {
        let q = MemoryQueue::new();
        for name in ["a", "b", "c"] {
            q.put(&make_task(name, TaskPriority::High)).await.unwrap();
        }
        assert_eq!(q.pop().await.unwrap().unwrap().name, "a");
        assert_eq!(q.pop().await.unwrap().unwrap().name, "b");
        assert_eq!(q.pop().await.unwrap().unwrap().name, "c");
    }

    #[tokio::test]
    async fn delayed_tasks_wait_for_eligibility() {
        let q = MemoryQueue::new();
        let mut task = make_task("later", TaskPriority::Critical);
        task.scheduled_time = Some(Utc::now() + chrono::Duration::milliseconds(150));
        q.put(&task).await.unwrap();

        assert!(q.pop().await.unwrap().is_none());
        assert_eq!(q.size().await.unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(q.pop().await.unwrap().unwrap().name, "later");
    }

    #[tokio::test]
    async fn remove_drops_queued_and_delayed_tasks() {
        let q = MemoryQueue::new();
        let ready = make_task("ready", TaskPriority::Medium);
        let mut delayed = make_task("delayed", TaskPriority::Medium);
        delayed.scheduled_time = Some(Utc::now() + chrono::Duration::seconds(60));
        q.put(&ready).await.unwrap();
        q.put(&delayed).await.unwrap();

        assert!(q.remove(&ready.id).await.unwrap());
        assert!(q.remove(&delayed.id).await.unwrap());
        assert!(!q.remove(&ready.id).await.unwrap());
        assert_eq!(q.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn result_cache_honors_ttl() {
        let q = MemoryQueue::new();
        let id = TaskId::new();
        q.set_result(&id, &serde_json::json!({"ok": true}), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(q.get_result(&id).await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(q.get_result(&id).await.unwrap().is_none());
    }
}
