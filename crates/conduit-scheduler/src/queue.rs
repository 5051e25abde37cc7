//! Ready queue with global worker capacity and per-class limits.

use chrono::{DateTime, Utc};
use conduit_core::ids::{JobInstanceId, RunId};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// A job whose dependencies are satisfied, waiting for a worker slot.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub run_id: RunId,
    pub job: JobInstanceId,
    pub resource_class: Option<String>,
    pub queued_at: DateTime<Utc>,
    seq: u64,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Earliest enqueued first
        other.seq.cmp(&self.seq)
    }
}

#[derive(Debug)]
pub struct ReadyQueue {
    queue: BinaryHeap<QueuedJob>,
    capacity: usize,
    in_flight: usize,
    class_running: HashMap<String, usize>,
    class_limits: HashMap<String, usize>,
    next_seq: u64,
}

impl ReadyQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: BinaryHeap::new(),
            capacity: capacity.max(1),
            in_flight: 0,
            class_running: HashMap::new(),
            class_limits: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn with_class_limit(mut self, class: impl Into<String>, limit: usize) -> Self {
        self.set_class_limit(class, limit);
        self
    }

    pub fn set_class_limit(&mut self, class: impl Into<String>, limit: usize) {
        self.class_limits.insert(class.into(), limit.max(1));
    }

    pub fn enqueue(&mut self, run_id: RunId, job: JobInstanceId, resource_class: Option<String>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(QueuedJob {
            run_id,
            job,
            resource_class,
            queued_at: Utc::now(),
            seq,
        });
    }

    /// Next job that fits the free capacity, claiming its slot.
    ///
    /// Jobs blocked by their resource class are skipped, not reordered.
    pub fn dequeue(&mut self) -> Option<QueuedJob> {
        if self.in_flight >= self.capacity {
            return None;
        }

        let mut skipped = Vec::new();
        let mut result = None;
        while let Some(job) = self.queue.pop() {
            if self.class_has_room(job.resource_class.as_deref()) {
                result = Some(job);
                break;
            }
            skipped.push(job);
        }
        for job in skipped {
            self.queue.push(job);
        }

        if let Some(job) = &result {
            self.in_flight += 1;
            if let Some(class) = &job.resource_class {
                *self.class_running.entry(class.clone()).or_insert(0) += 1;
            }
        }
        result
    }

    /// Give back the slot claimed by a dequeued job.
    pub fn release(&mut self, resource_class: Option<&str>) {
        self.in_flight = self.in_flight.saturating_sub(1);
        if let Some(class) = resource_class
            && let Some(count) = self.class_running.get_mut(class)
        {
            *count = count.saturating_sub(1);
        }
    }

    /// Drop every queued job of a run. Returns how many were removed.
    pub fn purge(&mut self, run_id: RunId) -> usize {
        let before = self.queue.len();
        self.queue.retain(|job| job.run_id != run_id);
        before - self.queue.len()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.in_flight)
    }

    fn class_has_room(&self, class: Option<&str>) -> bool {
        let Some(class) = class else {
            return true;
        };
        match self.class_limits.get(class) {
            Some(limit) => self.class_running.get(class).copied().unwrap_or(0) < *limit,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(name: &str) -> JobInstanceId {
        JobInstanceId::new(name)
    }

    #[test]
    fn test_fifo_order() {
        let run = RunId::new();
        let mut queue = ReadyQueue::new(8);
        queue.enqueue(run, job("a"), None);
        queue.enqueue(run, job("b"), None);
        queue.enqueue(run, job("c"), None);

        let order: Vec<_> = std::iter::from_fn(|| queue.dequeue())
            .map(|j| j.job.to_string())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(queue.in_flight(), 3);
    }

    #[test]
    fn test_capacity_limits_dequeue() {
        let run = RunId::new();
        let mut queue = ReadyQueue::new(2);
        for name in ["a", "b", "c"] {
            queue.enqueue(run, job(name), None);
        }
        assert!(queue.dequeue().is_some());
        assert!(queue.dequeue().is_some());
        assert!(queue.dequeue().is_none());
        assert_eq!(queue.available(), 0);

        queue.release(None);
        assert_eq!(queue.dequeue().map(|j| j.job), Some(job("c")));
    }

    #[test]
    fn test_resource_class_limit_skips_blocked_jobs() {
        let run = RunId::new();
        let mut queue = ReadyQueue::new(4).with_class_limit("gpu", 1);
        queue.enqueue(run, job("train-1"), Some("gpu".into()));
        queue.enqueue(run, job("train-2"), Some("gpu".into()));
        queue.enqueue(run, job("lint"), None);

        assert_eq!(queue.dequeue().map(|j| j.job), Some(job("train-1")));
        assert_eq!(queue.dequeue().map(|j| j.job), Some(job("lint")));
        assert!(queue.dequeue().is_none());
        assert_eq!(queue.len(), 1);

        queue.release(Some("gpu"));
        assert_eq!(queue.dequeue().map(|j| j.job), Some(job("train-2")));
    }

    #[test]
    fn test_purge_run() {
        let (a, b) = (RunId::new(), RunId::new());
        let mut queue = ReadyQueue::new(1);
        queue.enqueue(a, job("x"), None);
        queue.enqueue(b, job("y"), None);
        queue.enqueue(a, job("z"), None);

        assert_eq!(queue.purge(a), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dequeue().map(|j| j.run_id), Some(b));
    }
}
