//! Ready Queue
//!
//! Tasks whose dependencies are satisfied wait here for a worker. Ordering
//! is strict priority, ties broken by submission order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::task::{Priority, TaskId};

/// Heap entry keyed by `(priority, -sequence)`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    priority: Priority,
    sequence: u64,
    task_id: TaskId,
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence (older) first
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Priority queue of dispatchable tasks.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    heap: BinaryHeap<QueueEntry>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a task. `sequence` must reflect creation order.
    pub fn push(&mut self, task_id: TaskId, priority: Priority, sequence: u64) {
        self.heap.push(QueueEntry {
            priority,
            sequence,
            task_id,
        });
    }

    /// Removes and returns the most urgent task.
    pub fn pop(&mut self) -> Option<TaskId> {
        self.heap.pop().map(|entry| entry.task_id)
    }

    /// Removes a task from the queue. Returns true if it was queued.
    pub fn remove(&mut self, task_id: TaskId) -> bool {
        let before = self.heap.len();
        self.heap.retain(|entry| entry.task_id != task_id);
        self.heap.len() != before
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.heap.iter().any(|entry| entry.task_id == task_id)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> TaskId {
        TaskId::from_raw(n)
    }

    #[test]
    fn test_higher_priority_first() {
        let mut queue = ReadyQueue::new();
        queue.push(id(1), Priority::Low, 1);
        queue.push(id(2), Priority::Critical, 2);
        queue.push(id(3), Priority::Normal, 3);
        queue.push(id(4), Priority::High, 4);

        assert_eq!(queue.pop(), Some(id(2)));
        assert_eq!(queue.pop(), Some(id(4)));
        assert_eq!(queue.pop(), Some(id(3)));
        assert_eq!(queue.pop(), Some(id(1)));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut queue = ReadyQueue::new();
        for n in 1..=5 {
            queue.push(id(n), Priority::Normal, n);
        }

        let order: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(order, (1..=5).map(id).collect::<Vec<_>>());
    }

    #[test]
    fn test_requeue_keeps_original_sequence() {
        let mut queue = ReadyQueue::new();
        queue.push(id(2), Priority::Normal, 20);
        // A retried task goes back in with its creation sequence
        queue.push(id(1), Priority::Normal, 10);

        assert_eq!(queue.pop(), Some(id(1)));
    }

    #[test]
    fn test_remove() {
        let mut queue = ReadyQueue::new();
        queue.push(id(1), Priority::Normal, 1);
        queue.push(id(2), Priority::Normal, 2);

        assert!(queue.remove(id(1)));
        assert!(!queue.remove(id(1)));
        assert!(!queue.contains(id(1)));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some(id(2)));
        assert!(queue.is_empty());
    }
}
