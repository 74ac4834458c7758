use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::time::Instant;

use provenance_core::{EventId, ProductId, TxRef};

/// Where an anchor task is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchorPhase {
    /// Not yet accepted by the ledger.
    Submit,
    /// Accepted; polling for a final outcome.
    Confirm { tx_ref: TxRef },
}

/// One event's journey to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorTask {
    pub event_id: EventId,
    pub product_id: ProductId,
    /// Position in the product's stream; orders submissions per product.
    pub sequence: u64,
    /// Manufacture anchor; its confirmation mints the product's ledger token.
    pub creation: bool,
    /// Attempts made in the current phase.
    pub attempt: u32,
    pub next_retry_at: Instant,
    pub phase: AnchorPhase,
}

impl AnchorTask {
    pub fn new(event_id: EventId, product_id: ProductId, sequence: u64, now: Instant) -> Self {
        Self {
            event_id,
            product_id,
            sequence,
            creation: false,
            attempt: 0,
            next_retry_at: now,
            phase: AnchorPhase::Submit,
        }
    }

    pub fn for_creation(mut self) -> Self {
        self.creation = true;
        self
    }

    pub fn is_submitting(&self) -> bool {
        self.phase == AnchorPhase::Submit
    }
}

#[derive(Debug)]
struct Scheduled {
    due: Instant,
    seq: u64,
    task: AnchorTask,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed: BinaryHeap is a max-heap, we want the earliest due first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.due.cmp(&self.due).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Due-time ordered task queue.
///
/// Also tracks, per product, the stream positions still waiting for their
/// first accepted submission so the worker can keep ledger submissions in
/// append order.
#[derive(Debug, Default)]
pub struct TaskQueue {
    heap: BinaryHeap<Scheduled>,
    next_seq: u64,
    awaiting_submit: HashMap<ProductId, BTreeSet<u64>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Enqueue a fresh task (phase `Submit`).
    pub fn admit(&mut self, task: AnchorTask) {
        if task.is_submitting() {
            self.awaiting_submit
                .entry(task.product_id)
                .or_default()
                .insert(task.sequence);
        }
        self.schedule(task);
    }

    /// Re-enqueue a task at its `next_retry_at`.
    pub fn schedule(&mut self, task: AnchorTask) {
        self.next_seq += 1;
        self.heap.push(Scheduled {
            due: task.next_retry_at,
            seq: self.next_seq,
            task,
        });
    }

    /// Pop the earliest task if it is due.
    pub fn pop_due(&mut self, now: Instant) -> Option<AnchorTask> {
        if self.heap.peek().is_some_and(|s| s.due <= now) {
            self.heap.pop().map(|s| s.task)
        } else {
            None
        }
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|s| s.due)
    }

    /// True when no earlier event of the same product is still waiting to be submitted.
    pub fn is_next_to_submit(&self, task: &AnchorTask) -> bool {
        self.awaiting_submit
            .get(&task.product_id)
            .and_then(|pending| pending.first())
            .is_none_or(|first| *first >= task.sequence)
    }

    /// The task left the submit phase (accepted or given up).
    pub fn submit_settled(&mut self, task: &AnchorTask) {
        if let Some(pending) = self.awaiting_submit.get_mut(&task.product_id) {
            pending.remove(&task.sequence);
            if pending.is_empty() {
                self.awaiting_submit.remove(&task.product_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn earliest_due_task_pops_first() {
        let now = Instant::now();
        let product = ProductId::new();
        let mut queue = TaskQueue::new();

        let mut late = AnchorTask::new(EventId::new(), product, 1, now);
        late.next_retry_at = now + Duration::from_millis(50);
        let early = AnchorTask::new(EventId::new(), product, 2, now);
        queue.schedule(late.clone());
        queue.schedule(early.clone());

        assert_eq!(queue.pop_due(now), Some(early));
        assert_eq!(queue.pop_due(now), None);
        assert_eq!(queue.next_due(), Some(late.next_retry_at));
        assert_eq!(queue.pop_due(now + Duration::from_millis(50)), Some(late));
        assert!(queue.is_empty());
    }

    #[test]
    fn equal_due_times_keep_insertion_order() {
        let now = Instant::now();
        let product = ProductId::new();
        let mut queue = TaskQueue::new();
        let tasks: Vec<_> = (1..=3)
            .map(|seq| AnchorTask::new(EventId::new(), product, seq, now))
            .collect();
        for t in &tasks {
            queue.schedule(t.clone());
        }
        let popped: Vec<_> = std::iter::from_fn(|| queue.pop_due(now)).collect();
        assert_eq!(popped, tasks);
    }

    #[test]
    fn later_events_wait_for_earlier_submissions() {
        let now = Instant::now();
        let product = ProductId::new();
        let mut queue = TaskQueue::new();
        let first = AnchorTask::new(EventId::new(), product, 1, now);
        let second = AnchorTask::new(EventId::new(), product, 2, now);
        let other = AnchorTask::new(EventId::new(), ProductId::new(), 5, now);
        queue.admit(first.clone());
        queue.admit(second.clone());
        queue.admit(other.clone());

        assert!(queue.is_next_to_submit(&first));
        assert!(!queue.is_next_to_submit(&second));
        assert!(queue.is_next_to_submit(&other));

        queue.submit_settled(&first);
        assert!(queue.is_next_to_submit(&second));
    }
}
