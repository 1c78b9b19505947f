//! Infrastructure adapters: queue backends and the SQLite persistence store.

pub mod queue;
pub mod store;

pub use queue::{PriorityTaskQueue, QueueBackend};
pub use store::{MetricsSnapshot, PersistenceStore, TaskRecord};
