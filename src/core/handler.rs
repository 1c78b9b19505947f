//! Typed dispatch seam: the `TaskHandler` trait and the registry mapping
//! function names to handlers.
//!
//! The registry is the sole extension point through which surrounding
//! subsystems (content generation, posting, market-data fetch, cleanup,
//! health checks) plug into the scheduler. The scheduler core has zero
//! knowledge of what a handler does; it only resolves a name and awaits the
//! result.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::core::SchedulerError;

/// Executable logic behind a task's `function` name.
///
/// Handlers receive the task's positional and keyword payload by value so
/// execution can be supervised on a separate tokio task. Errors returned
/// here are transient from the scheduler's point of view and enter the
/// retry path.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute the handler with the task's payload.
    async fn execute(
        &self,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> anyhow::Result<Value>;
}

impl std::fmt::Debug for dyn TaskHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TaskHandler")
    }
}

type BoxedHandlerFn = Arc<
    dyn Fn(
            Vec<Value>,
            Map<String, Value>,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>
        + Send
        + Sync,
>;

/// Adapter letting a plain async closure act as a [`TaskHandler`].
struct FnHandler {
    func: BoxedHandlerFn,
}

#[async_trait]
impl TaskHandler for FnHandler {
    async fn execute(
        &self,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> anyhow::Result<Value> {
        (self.func)(args, kwargs).await
    }
}

/// Compile-time-checked mapping from function names to handlers.
///
/// Producers populate the registry before the manager starts; afterwards it
/// is shared immutably across workers. An unknown name resolves to a
/// distinct [`SchedulerError::UnknownHandler`] rather than a runtime string
/// miss.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let name = name.into();
        tracing::info!(function = %name, "registered task handler");
        self.handlers.insert(name, handler);
    }

    /// Register a plain async closure without implementing [`TaskHandler`]
    /// by hand.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(Vec<Value>, Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let boxed: BoxedHandlerFn = Arc::new(move |args, kwargs| Box::pin(func(args, kwargs)));
        self.register(name, Arc::new(FnHandler { func: boxed }));
    }

    /// Resolve a function name to its handler.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::UnknownHandler`] when no handler is
    /// registered under `name`.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn TaskHandler>, SchedulerError> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownHandler(name.to_string()))
    }

    /// Whether a handler is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// All registered function names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
