//! Core scheduling abstractions: the task model, handler dispatch, resource
//! monitoring, the worker execution loop, and the supervising task manager.

pub mod error;
pub mod handler;
pub mod manager;
pub mod monitor;
pub mod task;
pub(crate) mod worker;

pub use error::{AppResult, SchedulerError};
pub use handler::{HandlerRegistry, TaskHandler};
pub use manager::{
    DashboardStats, PerformanceStats, SystemStats, TaskManager, TaskStats, WorkerStats,
};
pub use monitor::{ResourceMonitor, ResourceProbe, ResourceSample, StaticProbe, SystemProbe};
pub use task::{Task, TaskEnvelope, TaskId, TaskPriority, TaskSpec, TaskStatus};
