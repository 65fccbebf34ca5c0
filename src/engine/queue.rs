// src/engine/queue.rs

use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use tracing::debug;

use crate::run::RunId;
use crate::task::TaskId;

/// One READY task of one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub run: RunId,
    pub task: TaskId,
}

impl QueueKey {
    pub fn new(run: RunId, task: TaskId) -> Self {
        Self { run, task }
    }
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub key: QueueKey,
    /// Retry backoff: the entry may not be dispatched before this instant.
    pub not_before: Option<Instant>,
}

/// FIFO of READY tasks waiting for an executor slot.
///
/// Semantics:
/// - A task is queued at most once; pushing it again is a no-op.
/// - [`take`](Self::take) scans from the front and removes the eligible
///   entries. Entries it passes over (paused flow, per-flow cap, backoff)
///   keep their position, so the oldest waiting task is always considered
///   first once capacity frees up. Nothing waits forever while slots exist.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    entries: VecDeque<QueueEntry>,
    members: HashSet<QueueKey>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, key: &QueueKey) -> bool {
        self.members.contains(key)
    }

    /// Append a task. Returns false if it was already queued.
    pub fn push(&mut self, key: QueueKey, not_before: Option<Instant>) -> bool {
        if !self.members.insert(key.clone()) {
            debug!(run = %key.run, task = %key.task, "task already queued");
            return false;
        }
        self.entries.push_back(QueueEntry { key, not_before });
        true
    }

    pub fn remove(&mut self, key: &QueueKey) -> bool {
        if !self.members.remove(key) {
            return false;
        }
        self.entries.retain(|e| &e.key != key);
        true
    }

    /// Drop every entry belonging to `run`. Returns how many were removed.
    pub fn remove_run(&mut self, run: &RunId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| &e.key.run != run);
        self.members.retain(|k| &k.run != run);
        before - self.entries.len()
    }

    /// Remove and return up to `limit` entries accepted by `eligible`, in
    /// queue order. `eligible` is called once per inspected entry and may
    /// track its own per-flow budget.
    pub fn take(
        &mut self,
        limit: usize,
        mut eligible: impl FnMut(&QueueEntry) -> bool,
    ) -> Vec<QueueKey> {
        let mut taken = Vec::new();
        if limit == 0 {
            return taken;
        }

        let mut kept = VecDeque::with_capacity(self.entries.len());
        while let Some(entry) = self.entries.pop_front() {
            if taken.len() < limit && eligible(&entry) {
                self.members.remove(&entry.key);
                taken.push(entry.key);
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;

        taken
    }

    /// Earliest backoff deadline later than `now`. Entries already due are
    /// waiting on capacity, not on time, and are left out.
    pub fn next_not_before(&self, now: Instant) -> Option<Instant> {
        self.entries
            .iter()
            .filter_map(|e| e.not_before)
            .filter(|t| *t > now)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(flow: &str, task: &str) -> QueueKey {
        QueueKey::new(RunId::new(flow, 1), TaskId::from(task))
    }

    fn names(keys: &[QueueKey]) -> Vec<&str> {
        keys.iter().map(|k| k.task.as_str()).collect()
    }

    #[test]
    fn push_deduplicates() {
        let mut q = ReadyQueue::new();
        assert!(q.push(key("f", "a"), None));
        assert!(!q.push(key("f", "a"), None));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn take_is_fifo_and_respects_limit() {
        let mut q = ReadyQueue::new();
        for t in ["a", "b", "c"] {
            q.push(key("f", t), None);
        }
        assert_eq!(names(&q.take(2, |_| true)), vec!["a", "b"]);
        assert_eq!(names(&q.take(2, |_| true)), vec!["c"]);
        assert!(q.is_empty());
    }

    #[test]
    fn skipped_entries_keep_their_position() {
        let mut q = ReadyQueue::new();
        q.push(key("paused", "a"), None);
        q.push(key("f", "b"), None);
        q.push(key("paused", "c"), None);

        let taken = q.take(5, |e| e.key.run.flow != "paused");
        assert_eq!(names(&taken), vec!["b"]);

        let rest = q.take(5, |_| true);
        assert_eq!(names(&rest), vec!["a", "c"]);
    }

    #[test]
    fn backoff_entries_wait_until_due() {
        let now = Instant::now();
        let later = now + Duration::from_secs(10);
        let mut q = ReadyQueue::new();
        q.push(key("f", "retry"), Some(later));
        q.push(key("f", "fresh"), None);

        let due = |at: Instant| move |e: &QueueEntry| e.not_before.is_none_or(|t| t <= at);
        assert_eq!(names(&q.take(5, due(now))), vec!["fresh"]);
        assert_eq!(q.next_not_before(now), Some(later));
        assert_eq!(q.next_not_before(later), None);
        assert_eq!(names(&q.take(5, due(later))), vec!["retry"]);
    }

    #[test]
    fn remove_run_drops_only_that_run() {
        let mut q = ReadyQueue::new();
        q.push(QueueKey::new(RunId::new("f", 1), TaskId::from("a")), None);
        q.push(QueueKey::new(RunId::new("f", 2), TaskId::from("a")), None);

        assert_eq!(q.remove_run(&RunId::new("f", 1)), 1);
        assert!(q.contains(&QueueKey::new(RunId::new("f", 2), TaskId::from("a"))));
        assert!(q.push(QueueKey::new(RunId::new("f", 1), TaskId::from("a")), None));
    }
}
