//! Scheduling coordinator: a fair round-robin queue for bulk scan
//! tasks and a priority queue for filesystem events and DLQ retries.

use crate::models::TaskPayload;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Clone)]
pub struct PriorityTask {
    pub priority: i32,
    pub payload: TaskPayload,
    pub seq: u64,
}

impl PartialEq for PriorityTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for PriorityTask {}
impl PartialOrd for PriorityTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for PriorityTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Higher priority first; for ties, earlier enqueue (lower seq) first.
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct FairQueues {
    per_root: HashMap<String, VecDeque<TaskPayload>>,
    order: VecDeque<String>,
}

impl FairQueues {
    fn new() -> Self {
        FairQueues { per_root: HashMap::new(), order: VecDeque::new() }
    }

    fn push(&mut self, root_id: &str, task: TaskPayload) {
        if !self.per_root.contains_key(root_id) {
            self.order.push_back(root_id.to_string());
        }
        self.per_root.entry(root_id.to_string()).or_default().push_back(task);
    }

    fn pop(&mut self) -> Option<TaskPayload> {
        let rounds = self.order.len();
        for _ in 0..rounds {
            let root_id = self.order.pop_front()?;
            if let Some(queue) = self.per_root.get_mut(&root_id) {
                if let Some(task) = queue.pop_front() {
                    if queue.is_empty() {
                        self.per_root.remove(&root_id);
                    } else {
                        self.order.push_back(root_id);
                    }
                    return Some(task);
                }
            }
        }
        None
    }
}

/// Dispatches priority tasks (fs events, DLQ retries) ahead of fair-queued
/// bulk scan tasks, and exposes read-priority backpressure so interactive
/// search is never starved by background scanning.
pub struct Coordinator {
    fair: Mutex<FairQueues>,
    priority: Mutex<BinaryHeap<PriorityTask>>,
    seq: AtomicI64,
    active_searches: AtomicUsize,
    writer_queue_load: Mutex<f64>,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub fn new() -> Self {
        Coordinator {
            fair: Mutex::new(FairQueues::new()),
            priority: Mutex::new(BinaryHeap::new()),
            seq: AtomicI64::new(0),
            active_searches: AtomicUsize::new(0),
            writer_queue_load: Mutex::new(0.0),
        }
    }

    pub fn enqueue_fair(&self, root_id: &str, task: TaskPayload) {
        self.fair.lock().unwrap().push(root_id, task);
    }

    pub fn enqueue_priority(&self, task: TaskPayload, priority: i32) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) as u64;
        self.priority.lock().unwrap().push(PriorityTask { priority, payload: task, seq });
    }

    /// Returns a priority task if present, else a fair task, round-robin
    /// across roots.
    pub fn get_next_task(&self) -> Option<TaskPayload> {
        if let Some(task) = self.priority.lock().unwrap().pop() {
            return Some(task.payload);
        }
        self.fair.lock().unwrap().pop()
    }

    pub fn notify_search_start(&self) {
        self.active_searches.fetch_add(1, Ordering::SeqCst);
    }

    pub fn notify_search_end(&self) {
        self.active_searches.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn report_writer_queue_load(&self, load: f64) {
        *self.writer_queue_load.lock().unwrap() = load;
    }

    /// While a search is active, workers sleep a small delay before pulling
    /// their next task so interactive queries aren't starved by scans.
    pub fn get_sleep_penalty(&self) -> std::time::Duration {
        if self.active_searches.load(Ordering::SeqCst) > 0 {
            std::time::Duration::from_millis(50)
        } else {
            std::time::Duration::ZERO
        }
    }

    pub fn should_throttle_indexing(&self) -> bool {
        *self.writer_queue_load.lock().unwrap() > 0.5 || self.active_searches.load(Ordering::SeqCst) > 0
    }

    /// `>0.8` -> 0.5s sleep; `>0.5` -> 0.1s sleep; else no delay.
    pub fn dispatch_sleep(&self) -> std::time::Duration {
        let load = *self.writer_queue_load.lock().unwrap();
        if load > 0.8 {
            std::time::Duration::from_millis(500)
        } else if load > 0.5 {
            std::time::Duration::from_millis(100)
        } else {
            std::time::Duration::ZERO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(root_id: &str, path: &str) -> TaskPayload {
        TaskPayload::ScanFile { root_id: root_id.to_string(), path: path.to_string() }
    }

    #[test]
    fn fair_queue_round_robins_across_roots() {
        let c = Coordinator::new();
        c.enqueue_fair("r1", scan("r1", "a"));
        c.enqueue_fair("r1", scan("r1", "b"));
        c.enqueue_fair("r2", scan("r2", "c"));

        let order: Vec<_> = (0..3)
            .map(|_| match c.get_next_task().unwrap() {
                TaskPayload::ScanFile { root_id, .. } => root_id,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(order, vec!["r1", "r2", "r1"]);
    }

    #[test]
    fn priority_tasks_win_over_fair() {
        let c = Coordinator::new();
        c.enqueue_fair("r1", scan("r1", "a"));
        c.enqueue_priority(scan("r1", "urgent"), 10);
        match c.get_next_task().unwrap() {
            TaskPayload::ScanFile { path, .. } => assert_eq!(path, "urgent"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn throttle_follows_writer_queue_load() {
        let c = Coordinator::new();
        assert!(!c.should_throttle_indexing());
        c.report_writer_queue_load(0.9);
        assert!(c.should_throttle_indexing());
        assert_eq!(c.dispatch_sleep(), std::time::Duration::from_millis(500));
    }
}
