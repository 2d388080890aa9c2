//! Bounded, insertion-ordered history of recent messages.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use mk_protocol::Message;

pub const DEFAULT_CAPACITY: usize = 100;

/// Ring of the last `capacity` messages. Oldest entries are evicted first.
///
/// One writer (the inbound event loop) and any number of readers. Each
/// append publishes a fresh immutable [`HistorySnapshot`]; readers clone the
/// published `Arc` and never touch the writer's lock.
#[derive(Debug)]
pub struct HistoryRing {
    capacity: usize,
    writer: Mutex<VecDeque<Arc<Message>>>,
    published: watch::Sender<HistorySnapshot>,
}

impl HistoryRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            writer: Mutex::new(VecDeque::with_capacity(capacity)),
            published: watch::Sender::new(HistorySnapshot::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.published.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.published.borrow().is_empty()
    }

    pub fn append(&self, message: Message) {
        let mut entries = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(Arc::new(message));
        let snapshot = HistorySnapshot {
            entries: entries.iter().cloned().collect(),
        };
        // Published while still holding the writer lock so snapshots never
        // go backwards under concurrent appends.
        self.published.send_replace(snapshot);
    }

    pub fn snapshot(&self) -> HistorySnapshot {
        self.published.borrow().clone()
    }
}

impl Default for HistoryRing {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Point-in-time copy of the ring, oldest first.
#[derive(Debug, Clone, Default)]
pub struct HistorySnapshot {
    entries: Arc<[Arc<Message>]>,
}

impl HistorySnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Message> {
        self.entries.iter().map(|m| m.as_ref())
    }

    /// Up to `n` most recent messages other than `exclude_id`, oldest first.
    pub fn recent_excluding(&self, n: usize, exclude_id: &str) -> Vec<&Message> {
        let mut recent: Vec<&Message> = self
            .iter()
            .rev()
            .filter(|m| m.id != exclude_id)
            .take(n)
            .collect();
        recent.reverse();
        recent
    }
}
