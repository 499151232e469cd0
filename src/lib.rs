//! # forgepool
//!
//! Elastic, supervised worker pools for offloading blocking and CPU-bound
//! work from a tokio application.
//!
//! ## Features
//!
//! - **Elastic sizing**: Each pool keeps `min_workers` alive, grows to `max_workers` on demand and reclaims idle workers
//! - **Priorities**: Higher-priority tasks are dispatched first, FIFO within a priority
//! - **Timeouts**: Per-task deadlines; a stuck worker is replaced rather than reused
//! - **Crash isolation**: A panicking handler takes down only its own worker, which is respawned
//! - **Graceful shutdown**: Drain submitted work until a deadline, then reject the rest
//! - **Typed operations**: Closed operation enums per domain, validated before they are queued
//!
//! ## Quick Start
//!
//! ```rust
//! use forgepool::prelude::*;
//! use serde::{Deserialize, Serialize};
//! use serde_json::{Value, json};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! #[serde(tag = "type", content = "data", rename_all = "snake_case")]
//! enum QrOperation {
//!     Encode { text: String },
//! }
//!
//! impl Operation for QrOperation {
//!     fn validate(&self) -> PoolResult<()> {
//!         match self {
//!             QrOperation::Encode { text } if text.is_empty() => {
//!                 Err(PoolError::invalid_operation("nothing to encode"))
//!             }
//!             _ => Ok(()),
//!         }
//!     }
//! }
//!
//! struct QrHandler;
//!
//! #[async_trait]
//! impl OperationHandler<QrOperation> for QrHandler {
//!     async fn run(&mut self, operation: QrOperation) -> HandlerResult {
//!         match operation {
//!             QrOperation::Encode { text } => Ok(json!({"modules": text.len() * 8})),
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> PoolResult<()> {
//!     let registry = PoolRegistry::builder()
//!         .pool(
//!             "qrcode",
//!             PoolConfig::with_workers(1, 2),
//!             WorkerEntry::typed::<QrOperation, _, _>("qrcode", || QrHandler),
//!         )
//!         .build()
//!         .await?;
//!
//!     let pool = registry.get_domain(PoolDomain::QrCode)?;
//!     let out: Value = pool
//!         .submit(&QrOperation::Encode { text: "hi".into() }, TaskOptions::new().with_priority(5))
//!         .await?;
//!     assert_eq!(out, json!({"modules": 16}));
//!
//!     registry.shutdown_all(std::time::Duration::from_secs(5)).await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod handler;
pub mod protocol;
pub(crate) mod queue;
pub mod task;

#[cfg(feature = "metrics")]
#[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
pub mod metrics;

pub mod prelude {
    pub use crate::config::{LogLevel, LoggingConfig, PoolConfig, PoolDomain, RegistryConfig};
    pub use crate::core::{PoolHealth, PoolRegistry, PoolStats, TaskFuture, WorkerPool};
    pub use crate::error::{PoolError, PoolResult};
    pub use crate::handler::{HandlerResult, OperationHandler, TaskHandler, WorkerEntry};
    pub use crate::task::{Operation, TaskId, TaskOptions};
    pub use async_trait::async_trait;

    #[cfg(feature = "metrics")]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    pub use crate::metrics::PoolMetrics;
}

pub use crate::config::*;
pub use crate::core::{
    DeadWorker, PoolHealth, PoolRegistry, PoolRegistryBuilder, PoolStats, TaskFuture,
    WorkerDeathCause, WorkerId, WorkerPool, WorkerSnapshot,
};
pub use crate::error::{ErrorKind, PoolError, PoolResult};
pub use crate::handler::{
    BoxError, FnHandler, HandlerResult, OperationHandler, TaskHandler, TypedHandler, WorkerEntry,
};
pub use crate::protocol::{TaskRequest, TaskResponse};
pub use crate::task::{Operation, TaskId, TaskOptions};
pub use async_trait::async_trait;
