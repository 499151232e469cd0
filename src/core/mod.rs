//! The worker pool handle and its supervisor.
//!
//! [`WorkerPool`] is the primary interface of forgepool. It is a cheap,
//! cloneable handle to one running pool: submissions and shutdown requests
//! are forwarded to the pool's supervisor task, which owns every worker and
//! every queued task.

use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::handler::WorkerEntry;
use crate::task::{Operation, Task, TaskOptions};
use futures::FutureExt;
use futures::future::{self, BoxFuture};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

pub mod engine;
pub mod registry;
pub mod worker;

use engine::{Command, PoolSupervisor};

pub use engine::PoolStats;
pub use registry::{PoolRegistry, PoolRegistryBuilder};
pub use worker::{DeadWorker, WorkerDeathCause, WorkerId, WorkerSnapshot};

/// The pending result of a submitted task.
///
/// The task is already queued when this future is created; awaiting it only
/// waits for the outcome.
pub type TaskFuture<T> = BoxFuture<'static, PoolResult<T>>;

/// Coarse health classification of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PoolHealth {
    /// At least `min_workers` workers are alive
    Healthy,
    /// Some workers are alive, fewer than `min_workers`
    Degraded,
    /// No worker is alive
    Critical,
}

/// Handle to a running pool.
///
/// # Examples
///
/// ```rust
/// use forgepool::prelude::*;
/// use serde_json::{Value, json};
///
/// async fn echo(_task_type: String, data: Value) -> HandlerResult {
///     Ok(data)
/// }
///
/// #[tokio::main]
/// async fn main() -> PoolResult<()> {
///     let pool = WorkerPool::start(
///         "general",
///         PoolConfig::with_workers(1, 2),
///         WorkerEntry::from_fn("echo", echo),
///     )
///     .await?;
///
///     let answer: Value = pool.execute("echo", json!({"n": 1}), TaskOptions::new()).await?;
///     assert_eq!(answer, json!({"n": 1}));
///
///     pool.shutdown(std::time::Duration::from_secs(1)).await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct WorkerPool {
    name: Arc<str>,
    config: PoolConfig,
    commands: mpsc::UnboundedSender<Command>,
    stats: watch::Receiver<PoolStats>,
    shutting_down: Arc<AtomicBool>,
    supervisor: Arc<JoinHandle<()>>,
}

impl WorkerPool {
    /// Validate `config`, spawn `min_workers` workers and start supervising.
    pub async fn start(
        name: impl Into<String>,
        config: PoolConfig,
        entry: WorkerEntry,
    ) -> PoolResult<Self> {
        let name: Arc<str> = Arc::from(name.into());
        config.validate().map_err(|errors| {
            PoolError::config(format!("pool '{}': {}", name, errors.join("; ")))
        })?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stats_tx, stats_rx) = watch::channel(PoolStats::default());
        let shutting_down = Arc::new(AtomicBool::new(false));

        let supervisor = PoolSupervisor::start(
            Arc::clone(&name),
            config.clone(),
            entry,
            events_tx,
            stats_tx,
            Arc::clone(&shutting_down),
        );
        let handle = tokio::spawn(supervisor.run(commands_rx, events_rx));

        Ok(Self {
            name,
            config,
            commands: commands_tx,
            stats: stats_rx,
            shutting_down,
            supervisor: Arc::new(handle),
        })
    }

    /// Submit a task and get a future for its result.
    ///
    /// The task is enqueued before this returns. The future fails with
    /// [`PoolError::PoolShuttingDown`] right away if shutdown has begun.
    pub fn execute<TIn, TOut>(
        &self,
        task_type: impl Into<String>,
        data: TIn,
        options: TaskOptions,
    ) -> TaskFuture<TOut>
    where
        TIn: Serialize,
        TOut: DeserializeOwned + Send + 'static,
    {
        let enqueued = serde_json::to_value(data)
            .map_err(PoolError::from)
            .and_then(|payload| self.enqueue(task_type.into(), payload, options));

        match enqueued {
            Ok(receiver) => async move {
                let value = receiver.await.map_err(|_| PoolError::PoolShuttingDown)??;
                Ok::<TOut, PoolError>(serde_json::from_value(value)?)
            }
            .boxed(),
            Err(error) => future::ready(Err(error)).boxed(),
        }
    }

    /// Validate and submit a typed operation.
    pub fn submit<O, TOut>(&self, operation: &O, options: TaskOptions) -> TaskFuture<TOut>
    where
        O: Operation,
        TOut: DeserializeOwned + Send + 'static,
    {
        let parts = operation.validate().and_then(|()| operation.to_parts());
        match parts {
            Ok((task_type, data)) => self.execute(task_type, data, options),
            Err(error) => future::ready(Err(error)).boxed(),
        }
    }

    fn enqueue(
        &self,
        task_type: String,
        payload: Value,
        options: TaskOptions,
    ) -> PoolResult<oneshot::Receiver<PoolResult<Value>>> {
        if self.is_shutting_down() {
            return Err(PoolError::PoolShuttingDown);
        }

        let (task, receiver) = Task::new(task_type, payload, options);
        tracing::trace!("🔨 Pool '{}' submitting task {}", self.name, task.id);
        self.commands
            .send(Command::Execute(task))
            .map_err(|_| PoolError::PoolShuttingDown)?;
        Ok(receiver)
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> PoolStats {
        self.stats.borrow().clone()
    }

    /// Receiver notified whenever the statistics change.
    pub fn watch_stats(&self) -> watch::Receiver<PoolStats> {
        self.stats.clone()
    }

    /// Classify the pool by its live worker count.
    pub fn health(&self) -> PoolHealth {
        let stats = self.stats();
        if stats.total_workers == 0 {
            PoolHealth::Critical
        } else if stats.total_workers < self.config.min_workers {
            PoolHealth::Degraded
        } else {
            PoolHealth::Healthy
        }
    }

    /// Per-worker snapshots. Empty once the pool has shut down.
    pub async fn workers(&self) -> Vec<WorkerSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(Command::Inspect(reply_tx)).is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Stop accepting work, drain until `deadline`, then terminate all workers.
    ///
    /// Tasks still queued at the deadline fail with
    /// [`PoolError::PoolShuttingDown`]; tasks still running are abandoned
    /// and fail the same way. Calling this again, or on a pool that already
    /// shut down, returns once the pool is gone.
    pub async fn shutdown(&self, deadline: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let (done_tx, done_rx) = oneshot::channel();
        let command = Command::Shutdown {
            deadline,
            done: done_tx,
        };
        if self.commands.send(command).is_ok() {
            // A dropped sender means the supervisor already finished.
            let _ = done_rx.await;
        }
    }

    /// Whether shutdown has begun
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Whether the supervisor is still running
    pub fn is_running(&self) -> bool {
        !self.supervisor.is_finished()
    }

    /// Name of the pool
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the configuration used by this pool.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("stats", &*self.stats.borrow())
            .finish()
    }
}
