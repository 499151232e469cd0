//! Prometheus gauges mirroring [`PoolStats`].
//!
//! Nothing is collected automatically: call [`PoolMetrics::observe`] or
//! [`PoolMetrics::observe_registry`] from whatever drives your scrape
//! endpoint, or from a loop over [`WorkerPool::watch_stats`](crate::core::WorkerPool::watch_stats).

use crate::core::{PoolRegistry, PoolStats};
use crate::error::PoolResult;
use prometheus::{IntGaugeVec, Opts, Registry};

const POOL_LABEL: &str = "pool";

/// Per-pool gauges registered in their own [`Registry`].
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    registry: Registry,
    total_workers: IntGaugeVec,
    busy_workers: IntGaugeVec,
    idle_workers: IntGaugeVec,
    queued_tasks: IntGaugeVec,
    in_flight_tasks: IntGaugeVec,
    tasks_completed: IntGaugeVec,
    errors: IntGaugeVec,
    restarts: IntGaugeVec,
    shutting_down: IntGaugeVec,
}

impl PoolMetrics {
    /// Create the gauges and register them in a fresh registry.
    pub fn new() -> PoolResult<Self> {
        let registry = Registry::new_custom(Some("forgepool".to_string()), None)?;

        let gauge = |name: &str, help: &str| -> PoolResult<IntGaugeVec> {
            let vec = IntGaugeVec::new(Opts::new(name, help), &[POOL_LABEL])?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        };

        Ok(Self {
            total_workers: gauge("workers_total", "Live workers")?,
            busy_workers: gauge("workers_busy", "Workers with an assigned task")?,
            idle_workers: gauge("workers_idle", "Workers waiting for work")?,
            queued_tasks: gauge("tasks_queued", "Tasks waiting for a worker")?,
            in_flight_tasks: gauge("tasks_in_flight", "Tasks assigned and not yet settled")?,
            tasks_completed: gauge("tasks_completed", "Tasks completed successfully")?,
            errors: gauge("task_errors", "Failed, timed out and crashed tasks")?,
            restarts: gauge("worker_restarts", "Workers replaced after a crash or timeout")?,
            shutting_down: gauge("shutting_down", "1 once the pool began shutting down")?,
            registry,
        })
    }

    /// The registry to expose, e.g. through `prometheus::TextEncoder`.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record one pool's statistics.
    pub fn observe(&self, pool: &str, stats: &PoolStats) {
        let labels = [pool];
        self.total_workers
            .with_label_values(&labels)
            .set(stats.total_workers as i64);
        self.busy_workers
            .with_label_values(&labels)
            .set(stats.busy_workers as i64);
        self.idle_workers
            .with_label_values(&labels)
            .set(stats.idle_workers as i64);
        self.queued_tasks
            .with_label_values(&labels)
            .set(stats.queued_tasks as i64);
        self.in_flight_tasks
            .with_label_values(&labels)
            .set(stats.in_flight_tasks as i64);
        self.tasks_completed
            .with_label_values(&labels)
            .set(stats.total_tasks_completed as i64);
        self.errors
            .with_label_values(&labels)
            .set(stats.total_errors as i64);
        self.restarts
            .with_label_values(&labels)
            .set(stats.worker_restarts as i64);
        self.shutting_down
            .with_label_values(&labels)
            .set(i64::from(stats.shutting_down));
    }

    /// Record every pool of `registry`.
    pub fn observe_registry(&self, registry: &PoolRegistry) {
        for (name, stats) in registry.stats() {
            self.observe(&name, &stats);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_sets_labelled_gauges() {
        let metrics = PoolMetrics::new().unwrap();
        let stats = PoolStats {
            total_workers: 3,
            busy_workers: 2,
            idle_workers: 1,
            queued_tasks: 5,
            in_flight_tasks: 2,
            total_tasks_completed: 40,
            total_errors: 1,
            worker_restarts: 2,
            shutting_down: false,
        };

        metrics.observe("image", &stats);

        assert_eq!(metrics.total_workers.with_label_values(&["image"]).get(), 3);
        assert_eq!(metrics.queued_tasks.with_label_values(&["image"]).get(), 5);
        assert_eq!(metrics.tasks_completed.with_label_values(&["image"]).get(), 40);
        assert_eq!(metrics.restarts.with_label_values(&["image"]).get(), 2);
        assert_eq!(metrics.shutting_down.with_label_values(&["image"]).get(), 0);

        assert_eq!(metrics.registry().gather().len(), 9);
    }

    #[tokio::test]
    async fn test_observe_registry() {
        use crate::config::PoolConfig;
        use crate::handler::{HandlerResult, WorkerEntry};
        use serde_json::Value;
        use std::time::Duration;

        async fn noop(_task_type: String, _data: Value) -> HandlerResult {
            Ok(Value::Null)
        }

        let registry = PoolRegistry::builder()
            .pool("pdf", PoolConfig::with_workers(2, 2), WorkerEntry::from_fn("pdf", noop))
            .build()
            .await
            .unwrap();

        let metrics = PoolMetrics::new().unwrap();
        metrics.observe_registry(&registry);
        assert_eq!(metrics.total_workers.with_label_values(&["pdf"]).get(), 2);

        registry.shutdown_all(Duration::from_secs(1)).await;
    }
}
