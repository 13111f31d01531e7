//! Pending workload queue.
//!
//! Orders workloads by priority (higher first), then by submission sequence
//! (earlier first). A requeued workload keeps its original sequence number,
//! so it does not lose its place to later submissions of equal priority.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, HashMap};

use tessera_state::WorkloadKey;

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    priority: Reverse<i32>,
    seq: u64,
    key: WorkloadKey,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.seq.cmp(&other.seq))
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct PendingQueue {
    ordered: BTreeSet<QueueEntry>,
    index: HashMap<WorkloadKey, QueueEntry>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `key`. Re-pushing a queued key updates its position.
    pub fn push(&mut self, key: WorkloadKey, priority: i32, seq: u64) {
        self.remove(&key);
        let entry = QueueEntry {
            priority: Reverse(priority),
            seq,
            key: key.clone(),
        };
        self.ordered.insert(entry.clone());
        self.index.insert(key, entry);
    }

    pub fn remove(&mut self, key: &WorkloadKey) -> bool {
        match self.index.remove(key) {
            Some(entry) => self.ordered.remove(&entry),
            None => false,
        }
    }

    pub fn pop(&mut self) -> Option<WorkloadKey> {
        let entry = self.ordered.pop_first()?;
        self.index.remove(&entry.key);
        Some(entry.key)
    }

    /// Take every queued key, in admission order.
    pub fn drain(&mut self) -> Vec<WorkloadKey> {
        self.index.clear();
        std::mem::take(&mut self.ordered)
            .into_iter()
            .map(|e| e.key)
            .collect()
    }

    pub fn contains(&self, key: &WorkloadKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> WorkloadKey {
        WorkloadKey::new("default", name)
    }

    #[test]
    fn higher_priority_first_then_fifo() {
        let mut q = PendingQueue::new();
        q.push(key("low"), 0, 1);
        q.push(key("high-late"), 10, 3);
        q.push(key("high-early"), 10, 2);
        q.push(key("mid"), 5, 4);

        assert_eq!(
            q.drain(),
            vec![key("high-early"), key("high-late"), key("mid"), key("low")]
        );
        assert!(q.is_empty());
    }

    #[test]
    fn requeue_keeps_original_position() {
        let mut q = PendingQueue::new();
        q.push(key("a"), 0, 1);
        q.push(key("b"), 0, 2);
        assert_eq!(q.pop(), Some(key("a")));
        q.push(key("c"), 0, 3);
        q.push(key("a"), 0, 1);
        assert_eq!(q.drain(), vec![key("a"), key("b"), key("c")]);
    }

    #[test]
    fn push_is_idempotent_per_key() {
        let mut q = PendingQueue::new();
        q.push(key("a"), 0, 1);
        q.push(key("a"), 7, 1);
        assert_eq!(q.len(), 1);
        assert!(q.contains(&key("a")));
    }

    #[test]
    fn remove_unknown_is_false() {
        let mut q = PendingQueue::new();
        q.push(key("a"), 0, 1);
        assert!(!q.remove(&key("b")));
        assert!(q.remove(&key("a")));
        assert_eq!(q.pop(), None);
    }
}
