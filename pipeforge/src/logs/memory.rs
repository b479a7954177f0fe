//! In-memory log backend.

use super::backend::LogBackend;
use super::entry::LogEntry;
use super::query::{evaluate, summarize, LogPage, LogQuery, LogSummary, SummaryScope};
use crate::errors::StorageError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use uuid::Uuid;

/// Keeps the most recent entries of each execution in a bounded ring.
///
/// This backend never fails. It is always written, and it answers reads when
/// no durable backend is configured or the durable one is unreachable.
#[derive(Debug)]
pub struct InMemoryLogBackend {
    capacity: usize,
    executions: DashMap<Uuid, VecDeque<LogEntry>>,
}

impl Default for InMemoryLogBackend {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl InMemoryLogBackend {
    /// Creates a backend keeping at most `capacity` entries per execution.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            executions: DashMap::new(),
        }
    }

    /// Number of entries held for an execution.
    #[must_use]
    pub fn len(&self, execution_id: Uuid) -> usize {
        self.executions.get(&execution_id).map_or(0, |e| e.len())
    }

    /// Number of executions with at least one entry.
    #[must_use]
    pub fn execution_count(&self) -> usize {
        self.executions.len()
    }

    /// Synchronous append used by the log store's hot path.
    pub fn push(&self, entry: LogEntry) {
        let mut ring = self
            .executions
            .entry(entry.execution_id)
            .or_insert_with(|| VecDeque::with_capacity(self.capacity.min(256)));
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(entry);
    }

    /// Synchronous query.
    #[must_use]
    pub fn query_now(&self, query: &LogQuery, limit: usize) -> LogPage {
        self.executions
            .get(&query.execution_id)
            .map_or_else(LogPage::empty, |ring| evaluate(ring.iter(), query, limit))
    }

    /// Synchronous summary.
    #[must_use]
    pub fn summary_now(&self, scope: &SummaryScope) -> LogSummary {
        self.executions
            .get(&scope.execution_id)
            .map_or_else(LogSummary::default, |ring| summarize(ring.iter(), scope))
    }

    /// Highest sequence number held for an execution.
    #[must_use]
    pub fn last_sequence_now(&self, execution_id: Uuid) -> Option<u64> {
        self.executions
            .get(&execution_id)
            .and_then(|ring| ring.iter().map(|e| e.id).max())
    }

    /// The newest entry held for an execution.
    #[must_use]
    pub fn last_entry_now(&self, execution_id: Uuid) -> Option<LogEntry> {
        self.executions
            .get(&execution_id)
            .and_then(|ring| ring.iter().max_by_key(|e| e.sort_key()).cloned())
    }

    /// Drops every entry of an execution.
    pub fn remove(&self, execution_id: Uuid) -> u64 {
        self.executions
            .remove(&execution_id)
            .map_or(0, |(_, ring)| ring.len() as u64)
    }
}

#[async_trait]
impl LogBackend for InMemoryLogBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn append(&self, entry: &LogEntry) -> Result<(), StorageError> {
        self.push(entry.clone());
        Ok(())
    }

    async fn query(&self, query: &LogQuery, limit: usize) -> Result<LogPage, StorageError> {
        Ok(self.query_now(query, limit))
    }

    async fn summary(&self, scope: &SummaryScope) -> Result<LogSummary, StorageError> {
        Ok(self.summary_now(scope))
    }

    async fn last_sequence(&self, execution_id: Uuid) -> Result<Option<u64>, StorageError> {
        Ok(self.last_sequence_now(execution_id))
    }

    async fn delete_execution(&self, execution_id: Uuid) -> Result<u64, StorageError> {
        Ok(self.remove(execution_id))
    }
}
