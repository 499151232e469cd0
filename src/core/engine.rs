//! The pool supervisor - owns workers, queue and dispatching.
//!
//! One supervisor task per pool is the sole owner and mutator of the pool
//! state. It reacts to these inputs, one at a time:
//! - commands from [`WorkerPool`](super::WorkerPool) handles (submit, shutdown, inspect)
//! - worker events (responses, deaths) and task timer expiries
//! - the idle sweep tick
//! - the shutdown deadline and the restart backoff timer
//!
//! Every input is handled to completion, including the dispatch pass that
//! follows it, before the next one is looked at.

use crate::config::PoolConfig;
use crate::core::worker::{DeadWorker, WorkerEvent, WorkerId, WorkerInstance, WorkerSnapshot};
use crate::error::PoolError;
use crate::handler::WorkerEntry;
use crate::protocol::TaskResponse;
use crate::queue::{QueuedTask, TaskQueue};
use crate::task::{ResultSlot, Task, TaskId};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};

/// Snapshot of a pool's state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Live workers
    pub total_workers: usize,
    /// Workers with an assigned task
    pub busy_workers: usize,
    /// Workers waiting for work
    pub idle_workers: usize,
    /// Tasks waiting for a worker
    pub queued_tasks: usize,
    /// Tasks assigned to a worker and not yet settled
    pub in_flight_tasks: usize,
    /// Tasks that completed successfully since the pool started
    pub total_tasks_completed: u64,
    /// Failures, timeouts and crashes since the pool started
    pub total_errors: u64,
    /// Workers replaced after a crash or a timeout
    pub worker_restarts: u64,
    /// Whether shutdown has begun
    pub shutting_down: bool,
}

/// Stand-in for deadlines too far away to fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

const RESTART_BACKOFF_BASE: Duration = Duration::from_millis(100);
const RESTART_BACKOFF_MAX: Duration = Duration::from_secs(10);

/// `timeout` from now, saturating instead of overflowing.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Delay before replacing a dead worker, given how many workers in a row
/// died without settling a task. The first replacement is immediate.
fn restart_backoff(streak: u32) -> Duration {
    if streak <= 1 {
        return Duration::ZERO;
    }
    let exponent = (streak - 2).min(16);
    RESTART_BACKOFF_BASE
        .saturating_mul(1 << exponent)
        .min(RESTART_BACKOFF_MAX)
}

/// Requests from pool handles to the supervisor.
#[derive(Debug)]
pub(crate) enum Command {
    Execute(Task),
    Shutdown {
        deadline: Duration,
        done: oneshot::Sender<()>,
    },
    Inspect(oneshot::Sender<Vec<WorkerSnapshot>>),
}

/// A task that has been handed to a worker.
#[derive(Debug)]
struct InFlight {
    slot: ResultSlot,
    worker_id: WorkerId,
    timer: JoinHandle<()>,
}

#[derive(Debug)]
struct ShutdownState {
    deadline: Instant,
    expired: bool,
    waiters: Vec<oneshot::Sender<()>>,
}

/// The single writer of one pool's state.
pub(crate) struct PoolSupervisor {
    name: Arc<str>,
    config: PoolConfig,
    entry: WorkerEntry,
    workers: BTreeMap<WorkerId, WorkerInstance>,
    queue: TaskQueue,
    in_flight: HashMap<TaskId, InFlight>,
    next_worker_id: WorkerId,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    stats_tx: watch::Sender<PoolStats>,
    shutting_down: Arc<AtomicBool>,
    shutdown: Option<ShutdownState>,
    total_completed: u64,
    total_errors: u64,
    worker_restarts: u64,
    crash_streak: u32,
    respawn_at: Option<Instant>,
}

impl PoolSupervisor {
    /// Create the supervisor and spawn the initial `min_workers`.
    pub(crate) fn start(
        name: Arc<str>,
        config: PoolConfig,
        entry: WorkerEntry,
        events_tx: mpsc::UnboundedSender<WorkerEvent>,
        stats_tx: watch::Sender<PoolStats>,
        shutting_down: Arc<AtomicBool>,
    ) -> Self {
        let mut supervisor = Self {
            name,
            config,
            entry,
            workers: BTreeMap::new(),
            queue: TaskQueue::new(),
            in_flight: HashMap::new(),
            next_worker_id: 0,
            events_tx,
            stats_tx,
            shutting_down,
            shutdown: None,
            total_completed: 0,
            total_errors: 0,
            worker_restarts: 0,
            crash_streak: 0,
            respawn_at: None,
        };

        supervisor.ensure_min_workers();
        supervisor.publish();
        supervisor
    }

    /// Run the event loop until the pool has shut down.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        tracing::info!(
            "🔨 Pool '{}' started with {} workers (min {}, max {}, entry '{}')",
            self.name,
            self.workers.len(),
            self.config.min_workers,
            self.config.max_workers,
            self.entry.name()
        );

        let idle_timeout = self.config.idle_timeout();
        let mut sweep = interval_at(deadline_after(idle_timeout), idle_timeout);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commands_open = true;

        loop {
            let deadline = self.shutdown.as_ref().map(|state| state.deadline);
            let respawn_at = self.respawn_at;

            tokio::select! {
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        commands_open = false;
                        if self.shutdown.is_none() {
                            tracing::warn!(
                                "🔨 Pool '{}' dropped without shutdown(), draining in-flight work",
                                self.name
                            );
                            self.begin_shutdown(self.config.task_timeout(), None);
                        }
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
                _ = sweep.tick() => self.sweep_idle(),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.expire_shutdown();
                }
                _ = sleep_until(respawn_at.unwrap_or_else(Instant::now)), if respawn_at.is_some() => {
                    self.resume_respawn();
                }
            }

            if self.shutdown_complete() {
                self.finish();
                break;
            }

            self.publish();
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Execute(task) => {
                if self.shutdown.is_some() {
                    task.slot.resolve(Err(PoolError::PoolShuttingDown));
                    return;
                }

                tracing::debug!(
                    "🔨 Pool '{}' queued task {} ({}, priority {})",
                    self.name,
                    task.id,
                    task.task_type,
                    task.priority
                );
                self.queue.push(task);
                self.dispatch();
            }
            Command::Shutdown { deadline, done } => self.begin_shutdown(deadline, Some(done)),
            Command::Inspect(reply) => {
                let snapshots = self.workers.values().map(WorkerInstance::snapshot).collect();
                let _ = reply.send(snapshots);
            }
        }
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Completed {
                worker_id,
                response,
            } => self.complete(worker_id, response),
            WorkerEvent::Died(dead) => self.bury(dead),
            WorkerEvent::TimedOut {
                worker_id,
                task_id,
                timeout,
            } => self.time_out(worker_id, task_id, timeout),
        }
    }

    /// Match queued tasks with idle workers, growing the pool when allowed.
    fn dispatch(&mut self) {
        while !self.queue.is_empty() {
            let worker_id = match self.idle_worker().or_else(|| self.grow()) {
                Some(worker_id) => worker_id,
                // Backpressure: the rest waits in the queue.
                None => break,
            };

            let Some(queued) = self.queue.pop() else {
                break;
            };

            self.assign(worker_id, queued);
        }
    }

    fn idle_worker(&self) -> Option<WorkerId> {
        self.workers
            .values()
            .find(|worker| !worker.is_busy())
            .map(WorkerInstance::id)
    }

    fn grow(&mut self) -> Option<WorkerId> {
        if self.shutdown.is_some()
            || self.respawn_at.is_some()
            || self.workers.len() >= self.config.max_workers
        {
            return None;
        }
        Some(self.spawn_worker())
    }

    fn assign(&mut self, worker_id: WorkerId, queued: QueuedTask) {
        let QueuedTask { sequence, task } = queued;
        let priority = task.priority;
        let enqueued_at = task.enqueued_at;
        let waited = enqueued_at.elapsed();
        let (request, slot, timeout) = task.into_request();
        let task_id = request.task_id.clone();

        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return;
        };

        if let Err(request) = worker.assign(request) {
            // The unit is gone; its death notice may still be on the way.
            tracing::warn!(
                "🔨 Worker {} refused task {}, replacing it",
                worker_id,
                request.task_id
            );
            let task = Task {
                id: request.task_id,
                task_type: request.task_type,
                payload: request.data,
                priority,
                timeout,
                enqueued_at,
                slot,
            };
            self.queue.restore(QueuedTask { sequence, task });
            if let Some(worker) = self.workers.remove(&worker_id) {
                worker.terminate();
            }
            self.worker_restarts += self.ensure_min_workers() as u64;
            return;
        }

        let timeout = timeout.unwrap_or_else(|| self.config.task_timeout());
        let timer = {
            let events = self.events_tx.clone();
            let task_id = task_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = events.send(WorkerEvent::TimedOut {
                    worker_id,
                    task_id,
                    timeout,
                });
            })
        };

        tracing::debug!(
            "🔨 Task {} assigned to worker {} after {:?} in queue",
            task_id,
            worker_id,
            waited
        );

        self.in_flight.insert(
            task_id,
            InFlight {
                slot,
                worker_id,
                timer,
            },
        );
    }

    fn complete(&mut self, worker_id: WorkerId, response: TaskResponse) {
        let Some(in_flight) = self.in_flight.remove(&response.task_id) else {
            tracing::debug!(
                "🔨 Dropping response for settled task {} from worker {}",
                response.task_id,
                worker_id
            );
            return;
        };
        in_flight.timer.abort();

        let success = response.success;
        if let Some(worker) = self.workers.get_mut(&worker_id) {
            worker.release(success);
            self.crash_streak = 0;
        }

        if success {
            self.total_completed += 1;
            tracing::debug!(
                "🔨 Worker {} completed task {}",
                worker_id,
                response.task_id
            );
        } else {
            self.total_errors += 1;
            tracing::warn!(
                "🔨 Worker {} task {} failed: {}",
                worker_id,
                response.task_id,
                response.error.as_deref().unwrap_or("no message")
            );
        }

        in_flight.slot.resolve(response.into_result());
        self.dispatch();
    }

    fn time_out(&mut self, worker_id: WorkerId, task_id: TaskId, timeout: Duration) {
        let Some(in_flight) = self.in_flight.remove(&task_id) else {
            return;
        };
        if in_flight.worker_id != worker_id {
            tracing::warn!(
                "🔨 Timer for task {} named worker {}, but worker {} holds it",
                task_id,
                worker_id,
                in_flight.worker_id
            );
        }
        let worker_id = in_flight.worker_id;

        tracing::error!(
            "🔨 Task {} timed out after {:?} on worker {}, replacing the worker",
            task_id,
            timeout,
            worker_id
        );

        self.total_errors += 1;
        in_flight.slot.resolve(Err(PoolError::TaskTimeout {
            task_id,
            timeout_ms: timeout.as_millis() as u64,
        }));

        // A blocked handler keeps its thread until the call returns; the
        // thread is abandoned and a fresh worker takes the slot.
        if let Some(worker) = self.workers.remove(&worker_id) {
            worker.terminate();
            if self.shutdown.is_none() {
                self.spawn_worker();
                self.worker_restarts += 1;
            }
        }

        self.dispatch();
    }

    fn bury(&mut self, dead: DeadWorker) {
        let Some(worker) = self.workers.remove(&dead.worker_id) else {
            // Already removed on purpose.
            return;
        };

        tracing::error!(
            "🔨 Worker {} died after {:?}: {}",
            dead.worker_id,
            worker.lifetime_until(dead.died_at),
            dead.cause
        );

        if let Some(in_flight) = worker
            .current_task()
            .and_then(|task_id| self.in_flight.remove(task_id))
        {
            in_flight.timer.abort();
            self.total_errors += 1;
            in_flight.slot.resolve(Err(PoolError::WorkerCrash {
                worker_id: dead.worker_id,
                reason: dead.cause.to_string(),
            }));
        }

        self.crash_streak = if worker.has_finished_tasks() {
            1
        } else {
            self.crash_streak.saturating_add(1)
        };
        worker.terminate();

        let backoff = restart_backoff(self.crash_streak);
        if self.shutdown.is_none() && !backoff.is_zero() {
            tracing::warn!(
                "🔨 Pool '{}' lost {} workers in a row before they settled a task, backing off {:?}",
                self.name,
                self.crash_streak,
                backoff
            );
            self.respawn_at = Some(deadline_after(backoff));
            return;
        }

        self.worker_restarts += self.ensure_min_workers() as u64;
        self.dispatch();
    }

    fn resume_respawn(&mut self) {
        self.respawn_at = None;
        self.worker_restarts += self.ensure_min_workers() as u64;
        self.dispatch();
    }

    /// Terminate workers idle for longer than `idle_timeout`, down to `min_workers`.
    fn sweep_idle(&mut self) {
        let stats = self.stats();
        tracing::debug!(
            "🔨 Pool '{}' - Workers: {}/{} busy | Queue: {} | In flight: {} | Completed: {} | Errors: {} | Restarts: {}",
            self.name,
            stats.busy_workers,
            stats.total_workers,
            stats.queued_tasks,
            stats.in_flight_tasks,
            stats.total_tasks_completed,
            stats.total_errors,
            stats.worker_restarts
        );

        if self.shutdown.is_some() {
            return;
        }

        let idle_timeout = self.config.idle_timeout();
        let mut expired: Vec<(Duration, WorkerId)> = self
            .workers
            .values()
            .filter(|worker| !worker.is_busy() && worker.idle_for() > idle_timeout)
            .map(|worker| (worker.idle_for(), worker.id()))
            .collect();
        expired.sort_by(|a, b| b.0.cmp(&a.0));

        for (idle_for, worker_id) in expired {
            if self.workers.len() <= self.config.min_workers {
                break;
            }
            if let Some(worker) = self.workers.remove(&worker_id) {
                worker.terminate();
                tracing::info!(
                    "🔨 Pool '{}' reclaimed worker {} after {:?} idle",
                    self.name,
                    worker_id,
                    idle_for
                );
            }
        }
    }

    fn begin_shutdown(&mut self, deadline: Duration, done: Option<oneshot::Sender<()>>) {
        self.shutting_down.store(true, Ordering::SeqCst);

        match &mut self.shutdown {
            Some(state) => state.waiters.extend(done),
            None => {
                tracing::info!(
                    "🔨 Pool '{}' shutting down: {} queued, {} in flight, deadline {:?}",
                    self.name,
                    self.queue.len(),
                    self.in_flight.len(),
                    deadline
                );
                self.shutdown = Some(ShutdownState {
                    deadline: deadline_after(deadline),
                    expired: false,
                    waiters: done.into_iter().collect(),
                });
            }
        }
    }

    fn expire_shutdown(&mut self) {
        let rejected = self.queue.drain();
        if !rejected.is_empty() {
            tracing::warn!(
                "🔨 Pool '{}' shutdown deadline elapsed, rejecting {} queued tasks",
                self.name,
                rejected.len()
            );
        }
        for task in rejected {
            task.slot.resolve(Err(PoolError::PoolShuttingDown));
        }

        if let Some(state) = &mut self.shutdown {
            state.expired = true;
        }
    }

    fn shutdown_complete(&self) -> bool {
        match &self.shutdown {
            Some(state) => state.expired || (self.queue.is_empty() && self.in_flight.is_empty()),
            None => false,
        }
    }

    /// Tear everything down and release the shutdown waiters.
    fn finish(&mut self) {
        let workers = std::mem::take(&mut self.workers);
        let terminated = workers.len();
        for worker in workers.into_values() {
            worker.terminate();
        }

        // In-flight tasks are abandoned: their slots close unresolved.
        let abandoned = self.in_flight.len();
        for (_, in_flight) in self.in_flight.drain() {
            in_flight.timer.abort();
        }
        for task in self.queue.drain() {
            task.slot.resolve(Err(PoolError::PoolShuttingDown));
        }

        self.publish();

        tracing::info!(
            "🔨 Pool '{}' shut down ({} workers terminated, {} tasks abandoned)",
            self.name,
            terminated,
            abandoned
        );

        if let Some(state) = self.shutdown.take() {
            for waiter in state.waiters {
                let _ = waiter.send(());
            }
        }
    }

    /// Spawn workers up to `min_workers`, returning how many were started.
    fn ensure_min_workers(&mut self) -> usize {
        if self.shutdown.is_some() || self.respawn_at.is_some() {
            return 0;
        }
        let missing = self.config.min_workers.saturating_sub(self.workers.len());
        for _ in 0..missing {
            self.spawn_worker();
        }
        missing
    }

    fn spawn_worker(&mut self) -> WorkerId {
        let worker_id = self.next_worker_id;
        self.next_worker_id += 1;

        let worker =
            WorkerInstance::spawn(&self.name, worker_id, &self.entry, self.events_tx.clone());
        self.workers.insert(worker_id, worker);
        worker_id
    }

    fn stats(&self) -> PoolStats {
        let busy_workers = self.workers.values().filter(|w| w.is_busy()).count();
        PoolStats {
            total_workers: self.workers.len(),
            busy_workers,
            idle_workers: self.workers.len() - busy_workers,
            queued_tasks: self.queue.len(),
            in_flight_tasks: self.in_flight.len(),
            total_tasks_completed: self.total_completed,
            total_errors: self.total_errors,
            worker_restarts: self.worker_restarts,
            shutting_down: self.shutdown.is_some() || self.shutting_down.load(Ordering::SeqCst),
        }
    }

    fn publish(&self) {
        let stats = self.stats();
        self.stats_tx.send_if_modified(|current| {
            if *current == stats {
                false
            } else {
                *current = stats;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerResult;
    use crate::task::TaskOptions;
    use serde_json::{Value, json};

    async fn echo(_task_type: String, data: Value) -> HandlerResult {
        Ok(data)
    }

    fn test_supervisor(config: PoolConfig) -> (PoolSupervisor, watch::Receiver<PoolStats>) {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (stats_tx, stats_rx) = watch::channel(PoolStats::default());
        let supervisor = PoolSupervisor::start(
            Arc::from("test"),
            config,
            WorkerEntry::from_fn("echo", echo),
            events_tx,
            stats_tx,
            Arc::new(AtomicBool::new(false)),
        );
        (supervisor, stats_rx)
    }

    #[tokio::test]
    async fn test_start_spawns_min_workers() {
        let (mut supervisor, stats) = test_supervisor(PoolConfig::with_workers(2, 4));

        assert_eq!(stats.borrow().total_workers, 2);
        assert_eq!(stats.borrow().idle_workers, 2);

        supervisor.begin_shutdown(Duration::ZERO, None);
        supervisor.finish();
        assert_eq!(stats.borrow().total_workers, 0);
    }

    #[tokio::test]
    async fn test_dispatch_grows_to_max_then_queues() {
        let (mut supervisor, _stats) = test_supervisor(PoolConfig::with_workers(1, 2));

        let mut receivers = Vec::new();
        for i in 0..4 {
            let (task, rx) = Task::new("echo", json!(i), TaskOptions::new());
            receivers.push(rx);
            supervisor.handle_command(Command::Execute(task));
        }

        let stats = supervisor.stats();
        assert_eq!(stats.total_workers, 2);
        assert_eq!(stats.busy_workers, 2);
        assert_eq!(stats.in_flight_tasks, 2);
        assert_eq!(stats.queued_tasks, 2);

        supervisor.begin_shutdown(Duration::ZERO, None);
        supervisor.expire_shutdown();
        supervisor.finish();

        for rx in receivers {
            // Queued tasks are rejected, in-flight ones abandoned.
            match rx.await {
                Ok(Err(PoolError::PoolShuttingDown)) | Err(_) => {}
                other => panic!("Expected shutdown outcome, got: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_execute_after_shutdown_is_rejected() {
        let (mut supervisor, stats) = test_supervisor(PoolConfig::with_workers(1, 1));
        supervisor.begin_shutdown(Duration::from_secs(1), None);
        supervisor.publish();
        assert!(stats.borrow().shutting_down);

        let (task, rx) = Task::new("echo", Value::Null, TaskOptions::new());
        supervisor.handle_command(Command::Execute(task));

        assert!(matches!(rx.await, Ok(Err(PoolError::PoolShuttingDown))));
        assert!(supervisor.shutdown_complete());
        supervisor.finish();
    }

    #[tokio::test]
    async fn test_late_response_is_dropped() {
        let (mut supervisor, _stats) = test_supervisor(PoolConfig::with_workers(1, 1));

        supervisor.complete(0, TaskResponse::success("never-submitted", json!(1)));

        let stats = supervisor.stats();
        assert_eq!(stats.total_tasks_completed, 0);
        assert_eq!(stats.idle_workers, 1);

        supervisor.begin_shutdown(Duration::ZERO, None);
        supervisor.finish();
    }

    #[test]
    fn test_deadline_after_saturates() {
        let far = deadline_after(Duration::MAX);
        assert!(far > Instant::now() + Duration::from_secs(86_400 * 365));
    }

    #[test]
    fn test_restart_backoff_grows_and_caps() {
        assert_eq!(restart_backoff(0), Duration::ZERO);
        assert_eq!(restart_backoff(1), Duration::ZERO);
        assert_eq!(restart_backoff(2), Duration::from_millis(100));
        assert_eq!(restart_backoff(3), Duration::from_millis(200));
        assert_eq!(restart_backoff(5), Duration::from_millis(800));
        assert_eq!(restart_backoff(40), RESTART_BACKOFF_MAX);
    }

    #[tokio::test]
    async fn test_repeated_early_deaths_back_off() {
        use crate::core::worker::WorkerDeathCause;
        use std::time::SystemTime;

        let dead = |worker_id| DeadWorker {
            worker_id,
            cause: WorkerDeathCause::Panic("boom".to_string()),
            died_at: SystemTime::now(),
        };
        let (mut supervisor, _stats) = test_supervisor(PoolConfig::with_workers(1, 2));

        // First death: replaced on the spot.
        supervisor.bury(dead(0));
        assert_eq!(supervisor.stats().total_workers, 1);
        assert!(supervisor.respawn_at.is_none());

        // The replacement dies before settling anything: back off.
        supervisor.bury(dead(1));
        assert_eq!(supervisor.stats().total_workers, 0);
        assert!(supervisor.respawn_at.is_some());

        // No growth while backing off either.
        let (task, _rx) = Task::new("echo", json!(1), TaskOptions::new());
        supervisor.handle_command(Command::Execute(task));
        assert_eq!(supervisor.stats().queued_tasks, 1);

        supervisor.resume_respawn();
        let stats = supervisor.stats();
        assert_eq!(stats.total_workers, 1);
        assert_eq!(stats.in_flight_tasks, 1);
        assert_eq!(stats.worker_restarts, 2);

        supervisor.begin_shutdown(Duration::ZERO, None);
        supervisor.expire_shutdown();
        supervisor.finish();
    }
}
