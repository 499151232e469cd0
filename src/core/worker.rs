//! Worker implementation for forgepool.
//!
//! Each worker owns one execution unit: a dedicated OS thread driving a
//! current-thread tokio runtime. The unit runs a private [`TaskHandler`] that
//! receives [`TaskRequest`]s through its own inbox and reports every outcome
//! on the supervisor's event channel, so a handler that blocks or burns CPU
//! never holds up the supervisor or its timers. The [`WorkerInstance`] is the
//! supervisor-side bookkeeping for that unit.

use crate::handler::{TaskHandler, WorkerEntry};
use crate::protocol::{TaskRequest, TaskResponse};
use crate::task::TaskId;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, oneshot};

/// Identifier of a worker within its pool
pub type WorkerId = usize;

/// Reasons why an execution unit might die
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerDeathCause {
    /// The handler (or its factory) panicked
    Panic(String),
    /// The unit's thread or runtime could not be started
    Startup(String),
    /// The unit stopped on its own, e.g. because the supervisor went away
    Exited,
}

impl std::fmt::Display for WorkerDeathCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerDeathCause::Panic(message) => write!(f, "panicked: {}", message),
            WorkerDeathCause::Startup(message) => write!(f, "failed to start: {}", message),
            WorkerDeathCause::Exited => write!(f, "exited unexpectedly"),
        }
    }
}

/// Information about a dead worker
#[derive(Debug, Clone)]
pub struct DeadWorker {
    /// Worker identifier
    pub worker_id: WorkerId,
    /// Why the worker died
    pub cause: WorkerDeathCause,
    /// When the worker died
    pub died_at: SystemTime,
}

impl DeadWorker {
    fn new(worker_id: WorkerId, cause: WorkerDeathCause) -> Self {
        Self {
            worker_id,
            cause,
            died_at: SystemTime::now(),
        }
    }
}

/// Everything the supervisor hears from workers and timers.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    /// A worker answered a request
    Completed {
        worker_id: WorkerId,
        response: TaskResponse,
    },
    /// An execution unit terminated outside the protocol
    Died(DeadWorker),
    /// A task's timer fired
    TimedOut {
        worker_id: WorkerId,
        task_id: TaskId,
        timeout: Duration,
    },
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    /// Worker identifier
    pub id: WorkerId,
    /// Whether a task is assigned
    pub busy: bool,
    /// The assigned task, if any
    pub current_task: Option<TaskId>,
    /// Tasks completed successfully
    pub completed: u64,
    /// Tasks that failed, timed out or crashed on this worker
    pub errors: u64,
    /// Milliseconds since the last assignment or completion
    pub idle_for_ms: u64,
}

/// Supervisor-side state of one worker.
#[derive(Debug)]
pub(crate) struct WorkerInstance {
    id: WorkerId,
    inbox: mpsc::Sender<TaskRequest>,
    stop: oneshot::Sender<()>,
    current_task: Option<TaskId>,
    completed: u64,
    errors: u64,
    spawned_at: SystemTime,
    last_activity: Instant,
}

impl WorkerInstance {
    /// Start a new execution unit bound to `entry` on its own thread.
    ///
    /// A unit that cannot be started is reported as dead right away.
    pub(crate) fn spawn(
        pool: &str,
        id: WorkerId,
        entry: &WorkerEntry,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        // One slot: a worker never holds more than one request.
        let (inbox, inbox_rx) = mpsc::channel(1);
        let (stop, stop_rx) = oneshot::channel();
        let unit_entry = entry.clone();
        let unit_events = events.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("{}-worker-{}", pool, id))
            .spawn(move || run_thread(id, unit_entry, inbox_rx, stop_rx, unit_events));

        match spawned {
            Ok(_) => tracing::debug!("🔨 Spawned worker {}", id),
            Err(e) => {
                tracing::error!("🔨 Unable to start a thread for worker {}: {}", id, e);
                let cause = WorkerDeathCause::Startup(e.to_string());
                let _ = events.send(WorkerEvent::Died(DeadWorker::new(id, cause)));
            }
        }

        Self {
            id,
            inbox,
            stop,
            current_task: None,
            completed: 0,
            errors: 0,
            spawned_at: SystemTime::now(),
            last_activity: Instant::now(),
        }
    }

    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.current_task.is_some()
    }

    pub(crate) fn current_task(&self) -> Option<&TaskId> {
        self.current_task.as_ref()
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Whether the worker ever settled a task, successfully or not.
    pub(crate) fn has_finished_tasks(&self) -> bool {
        self.completed + self.errors > 0
    }

    /// How long the worker had been alive at `at`.
    pub(crate) fn lifetime_until(&self, at: SystemTime) -> Duration {
        at.duration_since(self.spawned_at).unwrap_or_default()
    }

    /// Hand a request to the unit and mark the worker busy.
    ///
    /// Gives the request back if the unit can no longer take it.
    pub(crate) fn assign(&mut self, request: TaskRequest) -> Result<(), TaskRequest> {
        if self.is_busy() {
            return Err(request);
        }

        let task_id = request.task_id.clone();
        self.inbox
            .try_send(request)
            .map_err(|error| error.into_inner())?;

        self.current_task = Some(task_id);
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Back to idle after the current task settled.
    pub(crate) fn release(&mut self, success: bool) {
        self.current_task = None;
        self.last_activity = Instant::now();
        if success {
            self.completed += 1;
        } else {
            self.errors += 1;
        }
    }

    /// Stop the execution unit and forget about it.
    ///
    /// An async handler is cancelled at its next await point. A handler
    /// blocked in a call keeps its thread until the call returns; the thread
    /// then exits and whatever it produced is dropped.
    pub(crate) fn terminate(self) {
        let _ = self.stop.send(());
        tracing::debug!("🔨 Terminated worker {}", self.id);
    }

    pub(crate) fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            busy: self.is_busy(),
            current_task: self.current_task.clone(),
            completed: self.completed,
            errors: self.errors,
            idle_for_ms: self.idle_for().as_millis() as u64,
        }
    }
}

/// How an execution unit's loop ended.
enum UnitExit {
    /// The supervisor asked it to stop
    Stopped,
    /// The inbox or the event channel closed under it
    Closed,
}

/// Body of a worker thread: build the runtime, run the unit, report its death.
fn run_thread(
    worker_id: WorkerId,
    entry: WorkerEntry,
    inbox: mpsc::Receiver<TaskRequest>,
    stop: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let cause = WorkerDeathCause::Startup(e.to_string());
            let _ = events.send(WorkerEvent::Died(DeadWorker::new(worker_id, cause)));
            return;
        }
    };

    let outcome = runtime.block_on(
        AssertUnwindSafe(async {
            let handler = entry.instantiate();
            run_unit(worker_id, handler, inbox, stop, &events).await
        })
        .catch_unwind(),
    );

    let cause = match outcome {
        Ok(UnitExit::Stopped) => return,
        Ok(UnitExit::Closed) => WorkerDeathCause::Exited,
        Err(panic) => WorkerDeathCause::Panic(panic_message(&*panic)),
    };
    let _ = events.send(WorkerEvent::Died(DeadWorker::new(worker_id, cause)));
}

/// The execution unit loop: one request in, one response out.
async fn run_unit(
    worker_id: WorkerId,
    mut handler: Box<dyn TaskHandler>,
    mut inbox: mpsc::Receiver<TaskRequest>,
    mut stop: oneshot::Receiver<()>,
    events: &mpsc::UnboundedSender<WorkerEvent>,
) -> UnitExit {
    loop {
        let request = tokio::select! {
            biased;
            _ = &mut stop => return UnitExit::Stopped,
            request = inbox.recv() => match request {
                Some(request) => request,
                None => return UnitExit::Closed,
            },
        };

        let TaskRequest {
            task_id,
            task_type,
            data,
        } = request;

        tracing::debug!(
            "🔨 Worker {} forging task {} ({})",
            worker_id,
            task_id,
            task_type
        );

        let response = tokio::select! {
            biased;
            _ = &mut stop => return UnitExit::Stopped,
            result = handler.handle(&task_type, data) => match result {
                Ok(value) => TaskResponse::success(task_id, value),
                Err(error) => TaskResponse::failure(task_id, error.to_string()),
            },
        };

        if events
            .send(WorkerEvent::Completed {
                worker_id,
                response,
            })
            .is_err()
        {
            return UnitExit::Closed;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
