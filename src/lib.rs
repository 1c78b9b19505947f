//! # Taskmill
//!
//! A local, resource-aware job scheduler that distributes many small,
//! heterogeneous automation jobs across a bounded pool of worker threads, so
//! that a single host does not saturate CPU or memory when many periodic jobs
//! fire concurrently.
//!
//! ## Core Problem Solved
//!
//! Automation fleets (content generation, market-data polling, social
//! posting, cleanup) tend to fire many periodic jobs at once:
//!
//! - **Host Saturation**: unbounded concurrency drives CPU to 100% and
//!   starves everything else on the machine
//! - **No Prioritization**: a bulk cleanup job should never delay a system
//!   health check
//! - **Transient Failures**: network-backed jobs need bounded retry with
//!   backoff, not crash-the-worker semantics
//!
//! ## Key Features
//!
//! - **Priority Task Queue**: five tiers with FIFO tie-break within a tier,
//!   backed by Redis sorted sets (multi-consumer) or an in-process heap
//! - **Resource-Aware Backpressure**: workers idle instead of draining the
//!   queue when host CPU/memory crosses configured thresholds
//! - **Adaptive Worker Pool**: an autoscaling loop grows and shrinks the
//!   pool from live resource samples, bounded by a configured maximum
//! - **Retry with Linear Backoff**: failed tasks re-enter the queue with a
//!   future eligibility time until their retry budget is exhausted
//! - **Durable Status**: every task and periodic system-metric snapshot is
//!   persisted to SQLite for status queries and historical dashboards
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use taskmill::{HandlerRegistry, ManagerConfig, TaskManager, TaskPriority, TaskSpec};
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register_fn("noop", |_args, _kwargs| async move {
//!     Ok(serde_json::json!("done"))
//! });
//!
//! let manager = std::sync::Arc::new(
//!     TaskManager::new(ManagerConfig::default(), registry).await?,
//! );
//! manager.start(None)?;
//!
//! let id = manager
//!     .submit_task(TaskSpec::new("demo", "noop").with_priority(TaskPriority::High))
//!     .await?;
//! let record = manager.get_task_status(&id)?;
//! manager.stop().await?;
//! ```
//!
//! For complete examples, see:
//! - `tests/scheduler_test.rs` - Full integration tests
//! - the `taskmill` binary (`start`, `dashboard`, `example` commands)

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling: task model, handler registry, monitor, workers, manager.
pub mod core;
/// Configuration model with builders, validation, and environment loading.
pub mod config;
/// Infrastructure adapters: queue backends and the SQLite persistence store.
pub mod infra;
/// Shared utilities.
pub mod util;

pub use crate::config::ManagerConfig;
pub use crate::core::{
    DashboardStats, HandlerRegistry, ResourceMonitor, ResourceProbe, ResourceSample,
    SchedulerError, SystemProbe, Task, TaskHandler, TaskId, TaskManager, TaskPriority, TaskSpec,
    TaskStatus,
};
pub use crate::infra::{PersistenceStore, PriorityTaskQueue, TaskRecord};
