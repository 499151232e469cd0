//! Pending task queue for a single pool.
//!
//! Tasks wait here until the dispatcher finds them a worker. Ordering is by
//! priority (higher first) and, within a priority, by enqueue order. The
//! queue is owned by the pool supervisor and never shared, so it needs no
//! locking.

use crate::task::Task;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// A task together with its position in submission order.
#[derive(Debug)]
pub(crate) struct QueuedTask {
    pub(crate) sequence: u64,
    pub(crate) task: Task,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // Max-heap: higher priority wins, then the earlier sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Priority queue of pending, unassigned tasks.
#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
    heap: BinaryHeap<QueuedTask>,
    next_sequence: u64,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a task behind every queued task of the same priority.
    pub(crate) fn push(&mut self, task: Task) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(QueuedTask { sequence, task });
    }

    /// Put back a task taken with [`pop`](Self::pop), keeping its original place.
    pub(crate) fn restore(&mut self, queued: QueuedTask) {
        self.heap.push(queued);
    }

    /// Take the next task to dispatch
    pub(crate) fn pop(&mut self) -> Option<QueuedTask> {
        self.heap.pop()
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Remove every task, in dispatch order.
    pub(crate) fn drain(&mut self) -> Vec<Task> {
        let mut tasks = Vec::with_capacity(self.heap.len());
        while let Some(queued) = self.heap.pop() {
            tasks.push(queued.task);
        }
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskOptions;
    use serde_json::json;

    fn create_test_task(name: &str, priority: i32) -> Task {
        let (task, _rx) = Task::new(
            name,
            json!({"test": "data"}),
            TaskOptions::new().with_priority(priority),
        );
        task
    }

    fn pop_type(queue: &mut TaskQueue) -> String {
        queue.pop().unwrap().task.task_type
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut queue = TaskQueue::new();
        for name in ["a", "b", "c"] {
            queue.push(create_test_task(name, 0));
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(pop_type(&mut queue), "a");
        assert_eq!(pop_type(&mut queue), "b");
        assert_eq!(pop_type(&mut queue), "c");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_higher_priority_first() {
        let mut queue = TaskQueue::new();
        queue.push(create_test_task("low", 1));
        queue.push(create_test_task("high", 5));
        queue.push(create_test_task("negative", -3));
        queue.push(create_test_task("high-later", 5));

        assert_eq!(pop_type(&mut queue), "high");
        assert_eq!(pop_type(&mut queue), "high-later");
        assert_eq!(pop_type(&mut queue), "low");
        assert_eq!(pop_type(&mut queue), "negative");
    }

    #[test]
    fn test_restore_keeps_original_position() {
        let mut queue = TaskQueue::new();
        queue.push(create_test_task("first", 0));
        queue.push(create_test_task("second", 0));

        let first = queue.pop().unwrap();
        let first_id = first.task.id.clone();
        queue.restore(first);

        assert_eq!(queue.pop().unwrap().task.id, first_id);
    }

    #[test]
    fn test_drain_in_dispatch_order() {
        let mut queue = TaskQueue::new();
        queue.push(create_test_task("b", 0));
        queue.push(create_test_task("a", 9));

        let drained: Vec<String> = queue.drain().into_iter().map(|t| t.task_type).collect();
        assert_eq!(drained, vec!["a", "b"]);
        assert!(queue.is_empty());
    }
}
