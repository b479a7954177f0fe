//! Bounded buffer of entries awaiting a durable write.

use super::entry::LogEntry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;
use uuid::Uuid;

/// Counters describing durable-write degradation.
#[derive(Debug, Default)]
pub struct ReplayMetrics {
    buffered: AtomicU64,
    replayed: AtomicU64,
    lost: AtomicU64,
}

/// Point-in-time copy of [`ReplayMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplaySnapshot {
    /// Entries that went into the buffer.
    pub buffered: u64,
    /// Entries later written to the durable backend.
    pub replayed: u64,
    /// Entries never written durably: evicted from a full buffer or
    /// refused by the backend.
    pub lost: u64,
    /// Entries currently waiting.
    pub pending: u64,
}

impl ReplayMetrics {
    /// Entries that went into the buffer.
    #[must_use]
    pub fn buffered(&self) -> u64 {
        self.buffered.load(Ordering::Relaxed)
    }

    /// Entries later written to the durable backend.
    #[must_use]
    pub fn replayed(&self) -> u64 {
        self.replayed.load(Ordering::Relaxed)
    }

    /// Entries evicted from a full buffer or refused by the backend.
    #[must_use]
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    /// Converts metrics to a dictionary.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "buffered": self.buffered(),
            "replayed": self.replayed(),
            "lost": self.lost(),
        })
    }
}

/// FIFO of entries that could not be written durably.
///
/// When full, the oldest entry is dropped and counted as lost.
#[derive(Debug)]
pub struct ReplayBuffer {
    capacity: usize,
    pending: Mutex<VecDeque<LogEntry>>,
    metrics: ReplayMetrics,
}

impl ReplayBuffer {
    /// Creates a buffer holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pending: Mutex::new(VecDeque::new()),
            metrics: ReplayMetrics::default(),
        }
    }

    /// Queues an entry, evicting the oldest one if the buffer is full.
    pub fn push(&self, entry: LogEntry) {
        self.metrics.buffered.fetch_add(1, Ordering::Relaxed);
        if self.capacity == 0 {
            self.metrics.lost.fetch_add(1, Ordering::Relaxed);
            warn!(execution_id = %entry.execution_id, seq = entry.id, "replay buffer disabled, log entry lost");
            return;
        }
        let evicted = {
            let mut pending = self.pending.lock();
            let evicted = if pending.len() >= self.capacity {
                pending.pop_front()
            } else {
                None
            };
            pending.push_back(entry);
            evicted
        };
        if let Some(lost) = evicted {
            self.metrics.lost.fetch_add(1, Ordering::Relaxed);
            warn!(
                execution_id = %lost.execution_id,
                seq = lost.id,
                lost_total = self.metrics.lost(),
                "replay buffer full, oldest log entry lost"
            );
        }
    }

    /// Takes every pending entry, oldest first.
    pub fn take_all(&self) -> Vec<LogEntry> {
        self.pending.lock().drain(..).collect()
    }

    /// Puts back entries a replay attempt could not write, ahead of anything
    /// queued meanwhile. Overflow beyond capacity is dropped from the front.
    pub fn restore(&self, entries: Vec<LogEntry>) {
        let mut dropped = 0u64;
        {
            let mut pending = self.pending.lock();
            for entry in entries.into_iter().rev() {
                pending.push_front(entry);
            }
            while pending.len() > self.capacity {
                pending.pop_front();
                dropped += 1;
            }
        }
        if dropped > 0 {
            self.metrics.lost.fetch_add(dropped, Ordering::Relaxed);
            warn!(dropped, "replay buffer full on restore, log entries lost");
        }
    }

    /// Drops every pending entry of a deleted execution.
    pub fn discard_execution(&self, execution_id: Uuid) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|e| e.execution_id != execution_id);
        before - pending.len()
    }

    /// Counts entries written by a successful replay.
    pub fn mark_replayed(&self, count: usize) {
        self.metrics
            .replayed
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Counts entries the durable backend refused for good.
    pub fn mark_lost(&self, count: usize) {
        self.metrics.lost.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Returns true if an entry of `execution_id` is still waiting.
    #[must_use]
    pub fn has_execution(&self, execution_id: Uuid) -> bool {
        self.pending.lock().iter().any(|e| e.execution_id == execution_id)
    }

    /// Entries currently waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns true if nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Live counters.
    #[must_use]
    pub fn metrics(&self) -> &ReplayMetrics {
        &self.metrics
    }

    /// Copies the counters.
    #[must_use]
    pub fn snapshot(&self) -> ReplaySnapshot {
        ReplaySnapshot {
            buffered: self.metrics.buffered(),
            replayed: self.metrics.replayed(),
            lost: self.metrics.lost(),
            pending: self.len() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::LogLevel;

    fn entry(id: u64) -> LogEntry {
        let mut e = LogEntry::new(Uuid::nil(), "acme", "shop", LogLevel::Info, "m");
        e.id = id;
        e
    }

    #[test]
    fn test_overflow_drops_oldest_and_counts_lost() {
        let buffer = ReplayBuffer::new(2);
        buffer.push(entry(1));
        buffer.push(entry(2));
        buffer.push(entry(3));

        let ids: Vec<u64> = buffer.take_all().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(buffer.metrics().lost(), 1);
        assert_eq!(buffer.metrics().buffered(), 3);
    }

    #[test]
    fn test_restore_keeps_order() {
        let buffer = ReplayBuffer::new(5);
        buffer.push(entry(1));
        buffer.push(entry(2));
        let taken = buffer.take_all();
        buffer.push(entry(3));
        buffer.restore(taken);

        let ids: Vec<u64> = buffer.take_all().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_discard_execution() {
        let buffer = ReplayBuffer::new(5);
        buffer.push(entry(1));
        let mut other = entry(2);
        other.execution_id = Uuid::now_v7();
        buffer.push(other);
        assert!(buffer.has_execution(Uuid::nil()));
        assert_eq!(buffer.discard_execution(Uuid::nil()), 1);
        assert!(!buffer.has_execution(Uuid::nil()));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_snapshot() {
        let buffer = ReplayBuffer::new(5);
        buffer.push(entry(1));
        let taken = buffer.take_all();
        buffer.mark_replayed(taken.len());
        assert_eq!(
            buffer.snapshot(),
            ReplaySnapshot {
                buffered: 1,
                replayed: 1,
                lost: 0,
                pending: 0
            }
        );
    }
}
