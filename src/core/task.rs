//! Task model: identity, priority tiers, lifecycle status, the submission
//! spec, and the versioned wire envelope the queue carries.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::SchedulerError;
use crate::util::clock;

/// Default retry budget for a task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default per-task execution deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
/// The only task envelope version this build understands.
pub const ENVELOPE_VERSION: u8 = 1;

/// Opaque unique task identifier, generated at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a fresh identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an identifier from its hyphenated string form.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidSubmission`] if `raw` is not a UUID.
    pub fn parse(raw: &str) -> Result<Self, SchedulerError> {
        Uuid::parse_str(raw)
            .map(Self)
            .map_err(|e| SchedulerError::InvalidSubmission(format!("malformed task id: {e}")))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

/// Priority tier; lower numeric value dequeues first. Immutable after
/// creation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    /// System health, monitoring.
    Critical = 1,
    /// Real-time market data, urgent posts.
    High = 2,
    /// Regular content generation, scheduled posts.
    Medium = 3,
    /// Background tasks, analytics.
    Low = 4,
    /// Bulk operations, cleanup.
    Batch = 5,
}

impl TaskPriority {
    /// Numeric tier used for queue scores and persistence.
    #[must_use]
    pub const fn value(self) -> u8 {
        self as u8
    }

    /// Reconstruct a tier from its numeric form.
    #[must_use]
    pub const fn from_value(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Critical),
            2 => Some(Self::High),
            3 => Some(Self::Medium),
            4 => Some(Self::Low),
            5 => Some(Self::Batch),
            _ => None,
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Batch => "batch",
        };
        f.write_str(name)
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet enqueued.
    Pending,
    /// In the queue, waiting for a worker.
    Queued,
    /// Owned by exactly one worker.
    Running,
    /// Terminal success.
    Completed,
    /// Terminal failure (retry budget exhausted, or non-retryable).
    Failed,
    /// Transient failure; re-enqueued with a future eligibility time.
    Retry,
    /// Removed from the queue before any worker dequeued it.
    Cancelled,
}

impl TaskStatus {
    /// Stable string form used by the persistence layer.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retry => "retry",
            Self::Cancelled => "cancelled",
        }
    }

    /// Reconstruct a status from its persisted string form.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "retry" => Some(Self::Retry),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Submission arguments for [`crate::TaskManager::submit_task`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Human-readable label; not used for dispatch.
    pub name: String,
    /// Key into the handler registry.
    pub function: String,
    /// Positional payload passed to the handler.
    pub args: Vec<Value>,
    /// Keyword payload passed to the handler.
    pub kwargs: Map<String, Value>,
    /// Priority tier.
    pub priority: TaskPriority,
    /// Retry budget.
    pub max_retries: u32,
    /// Execution deadline.
    pub timeout: Duration,
}

impl TaskSpec {
    /// Create a spec with defaults: medium priority, 3 retries, 300 s timeout.
    pub fn new(name: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            function: function.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            priority: TaskPriority::Medium,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the positional payload.
    #[must_use]
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Set the keyword payload.
    #[must_use]
    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    /// Set the priority tier.
    #[must_use]
    pub const fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry budget.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the execution deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// One unit of schedulable work. Identity, payload, and priority are
/// immutable after creation; status and execution fields are written only by
/// the owning worker and the supervisor's persistence path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier, generated at submission.
    pub id: TaskId,
    /// Human-readable label; not used for dispatch.
    pub name: String,
    /// Key into the handler registry.
    pub function: String,
    /// Positional payload.
    pub args: Vec<Value>,
    /// Keyword payload.
    pub kwargs: Map<String, Value>,
    /// Priority tier. Never changes after creation.
    pub priority: TaskPriority,
    /// Retry budget.
    pub max_retries: u32,
    /// Retries consumed so far; never exceeds `max_retries`.
    pub retry_count: u32,
    /// Execution deadline enforced by the worker.
    pub timeout: Duration,
    /// Future eligibility time set by the retry path; the queue must not
    /// hand the task to a worker before it.
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Identifier of the executing worker, once dequeued.
    pub worker_id: Option<String>,
    /// Handler wall time in seconds, once finished.
    pub execution_time: Option<f64>,
    /// Handler result, on success.
    pub result: Option<Value>,
    /// Last failure message, if any.
    pub error: Option<String>,
}

impl Task {
    /// Build a pending task from a submission spec.
    #[must_use]
    pub fn from_spec(spec: TaskSpec) -> Self {
        Self {
            id: TaskId::new(),
            name: spec.name,
            function: spec.function,
            args: spec.args,
            kwargs: spec.kwargs,
            priority: spec.priority,
            max_retries: spec.max_retries,
            retry_count: 0,
            timeout: spec.timeout,
            scheduled_time: None,
            created_at: Utc::now(),
            status: TaskStatus::Pending,
            worker_id: None,
            execution_time: None,
            result: None,
            error: None,
        }
    }

    /// Queue score: priority tier plus a millisecond-scale fraction of the
    /// submission time, so tiers strictly dominate and earlier submissions
    /// win within a tier. Exact in `f64` for millisecond timestamps.
    #[must_use]
    pub fn queue_score(&self) -> f64 {
        queue_score(self.priority, clock::unix_ms_of(self.created_at))
    }

    /// Milliseconds since the epoch at which this task becomes eligible to
    /// run; `None` when it is eligible immediately.
    #[must_use]
    pub fn eligible_at_ms(&self) -> Option<i64> {
        self.scheduled_time.map(clock::unix_ms_of)
    }
}

/// Score a priority tier and submission instant for the ready index.
#[must_use]
pub fn queue_score(priority: TaskPriority, submitted_ms: i64) -> f64 {
    f64::from(priority.value()) + submitted_ms as f64 * 1e-13
}

/// The only wire form of a task. Decoding rejects unknown versions; no other
/// serialization of tasks crosses the queue boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    /// Envelope schema version.
    pub version: u8,
    /// The enclosed task.
    pub task: Task,
}

impl TaskEnvelope {
    /// Wrap a task in the current envelope version.
    #[must_use]
    pub const fn wrap(task: Task) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            task,
        }
    }

    /// Serialize the envelope to its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Codec`] if serialization fails.
    pub fn encode(&self) -> Result<String, SchedulerError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a wire envelope, rejecting unknown versions before the task
    /// body is interpreted.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::EnvelopeVersion`] for any version other
    /// than [`ENVELOPE_VERSION`], or [`SchedulerError::Codec`] if the JSON
    /// is malformed.
    pub fn decode(raw: &str) -> Result<Task, SchedulerError> {
        let value: Value = serde_json::from_str(raw)?;
        let version = value
            .get("version")
            .and_then(Value::as_u64)
            .and_then(|v| u8::try_from(v).ok())
            .unwrap_or(0);
        if version != ENVELOPE_VERSION {
            return Err(SchedulerError::EnvelopeVersion(version));
        }
        let envelope: Self = serde_json::from_value(value)?;
        Ok(envelope.task)
    }
}
