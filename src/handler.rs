//! The worker side of the execution protocol.
//!
//! A pool is configured with a [`WorkerEntry`]: a named factory that builds
//! one fresh [`TaskHandler`] per spawned worker. Workers never share handler
//! state, so a fault in one cannot leak into another.

use crate::task::Operation;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Boxed error returned by handlers; its `Display` output is what the caller sees.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result of handling one task.
pub type HandlerResult = Result<Value, BoxError>;

/// Runs the operations of one domain inside a worker.
///
/// An `Err` is an application-level failure and reaches the caller as
/// [`PoolError::TaskExecution`](crate::error::PoolError::TaskExecution).
/// A panic takes the whole worker down and is reported as a crash.
///
/// Every worker drives its handler on a dedicated thread, so blocking or
/// CPU-heavy work can run inline. A blocking call cannot be interrupted: when
/// its task times out the thread is abandoned and exits once the call returns.
#[async_trait]
pub trait TaskHandler: Send {
    /// Handle a single task. Unknown `task_type`s should return an error.
    async fn handle(&mut self, task_type: &str, data: Value) -> HandlerResult;
}

/// Worker entry point: builds a handler for every worker a pool spawns.
#[derive(Clone)]
pub struct WorkerEntry {
    name: Arc<str>,
    factory: Arc<dyn Fn() -> Box<dyn TaskHandler> + Send + Sync>,
}

impl WorkerEntry {
    /// Create an entry point from a handler factory.
    pub fn new<F, H>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: TaskHandler + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            factory: Arc::new(move || Box::new(factory()) as Box<dyn TaskHandler>),
        }
    }

    /// Create an entry point whose handlers are plain async functions.
    ///
    /// ```rust
    /// use forgepool::handler::{HandlerResult, WorkerEntry};
    ///
    /// async fn echo(_task_type: String, data: serde_json::Value) -> HandlerResult {
    ///     Ok(data)
    /// }
    ///
    /// let entry = WorkerEntry::from_fn("echo", echo);
    /// assert_eq!(entry.name(), "echo");
    /// ```
    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String, Value) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self::new(name, move || FnHandler(f.clone()))
    }

    /// Create an entry point for a typed operation handler.
    pub fn typed<O, F, H>(name: impl Into<String>, factory: F) -> Self
    where
        O: Operation + 'static,
        F: Fn() -> H + Send + Sync + 'static,
        H: OperationHandler<O> + 'static,
    {
        Self::new(name, move || TypedHandler::new(factory()))
    }

    /// Name of the entry point, used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn instantiate(&self) -> Box<dyn TaskHandler> {
        (self.factory)()
    }
}

impl fmt::Debug for WorkerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerEntry")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Adapter running an async closure as a [`TaskHandler`].
#[derive(Clone)]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(String, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&mut self, task_type: &str, data: Value) -> HandlerResult {
        (self.0)(task_type.to_string(), data).await
    }
}

/// Handles the decoded operations of one [`Operation`] enum.
#[async_trait]
pub trait OperationHandler<O: Operation>: Send {
    /// Run one operation.
    async fn run(&mut self, operation: O) -> HandlerResult;
}

/// Adapter decoding protocol messages into `O` before handing them to `H`.
pub struct TypedHandler<O, H> {
    inner: H,
    _operation: PhantomData<fn() -> O>,
}

impl<O, H> TypedHandler<O, H> {
    /// Wrap an operation handler
    pub fn new(inner: H) -> Self {
        Self {
            inner,
            _operation: PhantomData,
        }
    }
}

#[async_trait]
impl<O, H> TaskHandler for TypedHandler<O, H>
where
    O: Operation + 'static,
    H: OperationHandler<O>,
{
    async fn handle(&mut self, task_type: &str, data: Value) -> HandlerResult {
        let operation = O::from_parts(task_type, data)
            .map_err(|e| format!("Unsupported operation '{}': {}", task_type, e))?;
        self.inner.run(operation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data", rename_all = "snake_case")]
    enum MathOperation {
        Double { value: i64 },
        Negate { value: i64 },
    }

    impl Operation for MathOperation {}

    #[derive(Default)]
    struct MathHandler;

    #[async_trait]
    impl OperationHandler<MathOperation> for MathHandler {
        async fn run(&mut self, operation: MathOperation) -> HandlerResult {
            match operation {
                MathOperation::Double { value } => Ok(json!(value * 2)),
                MathOperation::Negate { value } => Ok(json!(-value)),
            }
        }
    }

    #[tokio::test]
    async fn test_typed_handler_dispatches_operations() {
        let entry = WorkerEntry::typed::<MathOperation, _, _>("math", MathHandler::default);
        let mut handler = entry.instantiate();

        let doubled = handler.handle("double", json!({"value": 21})).await.unwrap();
        assert_eq!(doubled, json!(42));

        let negated = handler.handle("negate", json!({"value": 5})).await.unwrap();
        assert_eq!(negated, json!(-5));
    }

    #[tokio::test]
    async fn test_typed_handler_reports_unknown_type() {
        let mut handler = TypedHandler::<MathOperation, _>::new(MathHandler);

        let error = handler.handle("sqrt", json!({"value": 4})).await.unwrap_err();
        assert!(error.to_string().starts_with("Unsupported operation 'sqrt'"));
    }

    async fn echo_or_fail(task_type: String, data: Value) -> HandlerResult {
        if task_type == "fail" {
            Err("requested failure".into())
        } else {
            Ok(data)
        }
    }

    #[tokio::test]
    async fn test_fn_entry_builds_independent_handlers() {
        let entry = WorkerEntry::from_fn("echo", echo_or_fail);

        let mut first = entry.instantiate();
        let mut second = entry.instantiate();

        assert_eq!(first.handle("echo", json!("a")).await.unwrap(), json!("a"));
        let error = second.handle("fail", Value::Null).await.unwrap_err();
        assert_eq!(error.to_string(), "requested failure");
        assert_eq!(format!("{:?}", entry), "WorkerEntry { name: \"echo\", .. }");
    }
}
