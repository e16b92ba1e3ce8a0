use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Ordering key of a queued executor. The id breaks virtual runtime ties so
/// the order is total and never depends on insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct QueueKey {
    pub virtual_runtime: i64,
    pub id: u64,
}

/// Executors waiting for a worker, lowest virtual runtime first.
///
/// Lives behind the scheduler's queue lock. The length is mirrored into a
/// shared atomic so the monitor and the timeout predicates can read it
/// without taking that lock.
#[derive(Debug)]
pub(crate) struct ReadyQueue<T> {
    entries: BTreeMap<QueueKey, T>,
    len: Arc<AtomicUsize>,
}

impl<T> ReadyQueue<T> {
    pub(crate) fn new(len: Arc<AtomicUsize>) -> Self {
        Self { entries: BTreeMap::new(), len }
    }

    /// Insert `item`. Returns `false` (and drops nothing) if the key is
    /// already present.
    pub(crate) fn push(&mut self, key: QueueKey, item: T) -> bool {
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, item);
        self.sync_len();
        true
    }

    pub(crate) fn pop_first(&mut self) -> Option<T> {
        let (_, item) = self.entries.pop_first()?;
        self.sync_len();
        Some(item)
    }

    pub(crate) fn first_key(&self) -> Option<QueueKey> {
        self.entries.keys().next().copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn sync_len(&self) {
        self.len.store(self.entries.len(), Ordering::Release);
    }
}
