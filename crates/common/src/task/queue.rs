use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Instant;

use super::Task;

struct Entry {
    when: Instant,
    sequence: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.when, self.sequence).cmp(&(other.when, other.sequence))
    }
}

/// Tasks ordered by due time, ties broken by insertion order.
///
/// Tasks still queued when the queue is dropped are aborted.
#[derive(Default)]
pub struct TaskQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    sequence: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&mut self, task: Task) {
        let sequence = self.sequence;
        self.sequence += 1;
        self.heap.push(Reverse(Entry {
            when: task.when(),
            sequence,
            task,
        }));
    }

    /// Remove the earliest task regardless of whether it is due.
    pub fn dequeue(&mut self) -> Option<Task> {
        self.heap.pop().map(|Reverse(entry)| entry.task)
    }

    /// Remove the earliest task if it is due at `now`.
    pub fn dequeue_ready(&mut self, now: Instant) -> Option<Task> {
        if self.ready(now) {
            self.dequeue()
        } else {
            None
        }
    }

    /// Whether the earliest task is due at `now`.
    pub fn ready(&self, now: Instant) -> bool {
        self.when().is_some_and(|when| when <= now)
    }

    /// Due time of the earliest task.
    pub fn when(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(entry)| entry.when)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        while let Some(task) = self.dequeue() {
            task.abort();
        }
    }
}
