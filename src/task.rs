//! Task definition, submission options and typed operations.

use crate::error::{PoolError, PoolResult};
use crate::protocol::TaskRequest;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Unique identifier for a task
pub type TaskId = String;

/// Per-submission options.
///
/// ```rust
/// use forgepool::task::TaskOptions;
/// use std::time::Duration;
///
/// let options = TaskOptions::new()
///     .with_priority(5)
///     .with_timeout(Duration::from_secs(2));
/// assert_eq!(options.priority, 5);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskOptions {
    /// Overrides the pool's default task timeout
    pub timeout: Option<Duration>,
    /// Higher is dispatched sooner; equal priorities keep submission order
    pub priority: i32,
}

impl TaskOptions {
    /// Default options: pool timeout, priority 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// The single-delivery result slot of a task.
///
/// Resolving consumes the slot, so a task can never be settled twice.
/// Dropping it unresolved makes the caller observe
/// [`PoolError::PoolShuttingDown`].
#[derive(Debug)]
pub(crate) struct ResultSlot(oneshot::Sender<PoolResult<Value>>);

impl ResultSlot {
    pub(crate) fn resolve(self, result: PoolResult<Value>) {
        // The caller may have stopped waiting; nothing to do then.
        let _ = self.0.send(result);
    }
}

/// A submitted task, owned by the supervisor from enqueue to settlement.
#[derive(Debug)]
pub(crate) struct Task {
    pub(crate) id: TaskId,
    pub(crate) task_type: String,
    pub(crate) payload: Value,
    pub(crate) priority: i32,
    pub(crate) timeout: Option<Duration>,
    pub(crate) enqueued_at: Instant,
    pub(crate) slot: ResultSlot,
}

impl Task {
    /// Create a task with a fresh id, returning the receiving end of its slot.
    pub(crate) fn new(
        task_type: impl Into<String>,
        payload: Value,
        options: TaskOptions,
    ) -> (Self, oneshot::Receiver<PoolResult<Value>>) {
        let (tx, rx) = oneshot::channel();
        let task = Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            payload,
            priority: options.priority,
            timeout: options.timeout,
            enqueued_at: Instant::now(),
            slot: ResultSlot(tx),
        };
        (task, rx)
    }

    /// Split into the protocol message and the parts the supervisor keeps.
    pub(crate) fn into_request(self) -> (TaskRequest, ResultSlot, Option<Duration>) {
        let request = TaskRequest {
            task_id: self.id,
            task_type: self.task_type,
            data: self.payload,
        };
        (request, self.slot, self.timeout)
    }
}

/// A closed set of operations a pool understands.
///
/// Implement it on an enum serialized as an adjacently tagged union; the tag
/// becomes the task `type` and the content becomes its `data`:
///
/// ```rust
/// use forgepool::task::Operation;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, PartialEq, Serialize, Deserialize)]
/// #[serde(tag = "type", content = "data", rename_all = "snake_case")]
/// enum QrOperation {
///     Generate { text: String, size: u32 },
/// }
///
/// impl Operation for QrOperation {}
///
/// let (task_type, data) = QrOperation::Generate { text: "hi".into(), size: 64 }
///     .to_parts()
///     .unwrap();
/// assert_eq!(task_type, "generate");
/// assert_eq!(data["size"], 64);
/// ```
pub trait Operation: Serialize + DeserializeOwned + Send + Sync {
    /// Check the payload before it is enqueued.
    fn validate(&self) -> PoolResult<()> {
        Ok(())
    }

    /// Split into the protocol `(type, data)` pair.
    fn to_parts(&self) -> PoolResult<(String, Value)> {
        let mut object = match serde_json::to_value(self)? {
            Value::Object(object) => object,
            other => {
                return Err(PoolError::invalid_operation(format!(
                    "operation must serialize to a tagged object, got {}",
                    other
                )));
            }
        };

        let task_type = match object.remove("type") {
            Some(Value::String(task_type)) => task_type,
            _ => {
                return Err(PoolError::invalid_operation(
                    "operation is missing its string \"type\" tag",
                ));
            }
        };

        Ok((task_type, object.remove("data").unwrap_or(Value::Null)))
    }

    /// Rebuild the operation from a protocol `(type, data)` pair.
    fn from_parts(task_type: &str, data: Value) -> PoolResult<Self> {
        let mut object = Map::new();
        object.insert("type".to_string(), Value::String(task_type.to_string()));
        if !data.is_null() {
            object.insert("data".to_string(), data);
        }
        Ok(serde_json::from_value(Value::Object(object))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data", rename_all = "snake_case")]
    enum ImageOperation {
        Resize { width: u32, height: u32 },
        Grayscale,
    }

    impl Operation for ImageOperation {
        fn validate(&self) -> PoolResult<()> {
            match self {
                ImageOperation::Resize { width: 0, .. } | ImageOperation::Resize { height: 0, .. } => {
                    Err(PoolError::invalid_operation("dimensions must be positive"))
                }
                _ => Ok(()),
            }
        }
    }

    #[test]
    fn test_operation_parts() {
        let (task_type, data) = ImageOperation::Resize {
            width: 10,
            height: 20,
        }
        .to_parts()
        .unwrap();

        assert_eq!(task_type, "resize");
        assert_eq!(data, json!({"width": 10, "height": 20}));

        let rebuilt = ImageOperation::from_parts(&task_type, data).unwrap();
        assert_eq!(
            rebuilt,
            ImageOperation::Resize {
                width: 10,
                height: 20
            }
        );
    }

    #[test]
    fn test_unit_operation_has_null_data() {
        let (task_type, data) = ImageOperation::Grayscale.to_parts().unwrap();
        assert_eq!(task_type, "grayscale");
        assert!(data.is_null());
        assert_eq!(
            ImageOperation::from_parts("grayscale", data).unwrap(),
            ImageOperation::Grayscale
        );
    }

    #[test]
    fn test_unknown_operation_type_is_rejected() {
        let result = ImageOperation::from_parts("blur", json!({"radius": 2}));
        assert!(matches!(result, Err(PoolError::SerializationError(_))));
    }

    #[test]
    fn test_operation_validation() {
        let invalid = ImageOperation::Resize {
            width: 0,
            height: 5,
        };
        assert!(matches!(
            invalid.validate(),
            Err(PoolError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn test_task_ids_are_unique() {
        let (a, _rx_a) = Task::new("echo", json!(1), TaskOptions::new());
        let (b, _rx_b) = Task::new("echo", json!(2), TaskOptions::new().with_priority(3));

        assert_ne!(a.id, b.id);
        assert_eq!(b.priority, 3);
    }

    #[tokio::test]
    async fn test_result_slot_delivers_once() {
        let (task, rx) = Task::new("echo", json!("hi"), TaskOptions::new());
        let (request, slot, timeout) = task.into_request();

        assert_eq!(request.task_type, "echo");
        assert_eq!(timeout, None);

        slot.resolve(Ok(json!("hi")));
        assert_eq!(rx.await.unwrap().unwrap(), json!("hi"));
    }

    #[tokio::test]
    async fn test_dropped_slot_closes_receiver() {
        let (task, rx) = Task::new("echo", Value::Null, TaskOptions::new());
        drop(task);
        assert!(rx.await.is_err());
    }
}
