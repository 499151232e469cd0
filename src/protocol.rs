//! The message contract between the pool supervisor and its workers.
//!
//! A worker receives one [`TaskRequest`] at a time and answers it with
//! exactly one [`TaskResponse`] carrying the same task id. The supervisor
//! never looks at `type` or `data`; it only correlates by id.
//!
//! Both messages serialize to the camelCase JSON shape
//! `{"taskId", "type", "data"}` / `{"taskId", "success", "data" | "error"}`.

use crate::error::PoolError;
use crate::task::TaskId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Work handed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    /// Correlation id
    pub task_id: TaskId,
    /// Operation discriminator, interpreted by the handler only
    #[serde(rename = "type")]
    pub task_type: String,
    /// Operation payload
    pub data: Value,
}

/// A worker's answer to a [`TaskRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    /// Correlation id, copied from the request
    pub task_id: TaskId,
    /// Whether the handler succeeded
    pub success: bool,
    /// Handler output on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Handler error message on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResponse {
    /// Successful response
    pub fn success(task_id: impl Into<TaskId>, data: Value) -> Self {
        Self {
            task_id: task_id.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Failed response
    pub fn failure(task_id: impl Into<TaskId>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Turn the response into the value the caller's future settles with.
    pub fn into_result(self) -> Result<Value, PoolError> {
        if self.success {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(PoolError::task_execution(
                self.error
                    .unwrap_or_else(|| "handler reported failure without a message".to_string()),
            ))
        }
    }
}
