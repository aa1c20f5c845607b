//! Execution queue shared by the scheduler and execution loops
//!
//! A min-heap keyed by `enqueue time + priority offset`, so higher priority
//! items dequeue first regardless of arrival order. All access goes through
//! one mutex; the queue performs no I/O and enqueue/dequeue cannot fail.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::{BackfillExecution, BackfillSchedule, ExecutionPriority};

/// Queue payload: a schedule snapshot paired with its execution
///
/// Owned exclusively by the queue while enqueued, handed off to the
/// execution loop on dequeue.
#[derive(Debug, Clone)]
pub struct ScheduledExecution {
    pub schedule: BackfillSchedule,
    pub execution: BackfillExecution,
}

struct QueueEntry {
    /// Priority-adjusted due time; smallest dequeues first
    key: DateTime<Utc>,
    /// Insertion sequence; breaks key ties (order not guaranteed to callers)
    seq: u64,
    payload: ScheduledExecution,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the smallest key on top
        other.key.cmp(&self.key).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueInner {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
}

/// Mutex-guarded priority queue of pending executions
pub struct ExecutionQueue {
    inner: Mutex<QueueInner>,
}

impl ExecutionQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
        }
    }

    /// Insert a schedule/execution pair keyed by `now + priority offset`
    pub async fn enqueue(
        &self,
        schedule: BackfillSchedule,
        execution: BackfillExecution,
        priority: ExecutionPriority,
    ) {
        let key = Utc::now() + priority.queue_offset();
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        debug!(
            execution = %execution.id,
            schedule = %schedule.id,
            %priority,
            depth = inner.heap.len() + 1,
            "ExecutionQueue::enqueue"
        );
        inner.heap.push(QueueEntry {
            key,
            seq,
            payload: ScheduledExecution { schedule, execution },
        });
    }

    /// Remove and return the payload with the smallest key, if any
    pub async fn try_dequeue(&self) -> Option<ScheduledExecution> {
        let mut inner = self.inner.lock().await;
        let entry = inner.heap.pop()?;
        debug!(
            execution = %entry.payload.execution.id,
            depth = inner.heap.len(),
            "ExecutionQueue::try_dequeue"
        );
        Some(entry.payload)
    }

    /// Current queue depth
    pub async fn len(&self) -> usize {
        self.inner.lock().await.heap.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.heap.is_empty()
    }
}

impl Default for ExecutionQueue {
    fn default() -> Self {
        Self::new()
    }
}
