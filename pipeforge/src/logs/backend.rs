//! Storage seam of the log store.

use super::entry::LogEntry;
use super::query::{LogPage, LogQuery, LogSummary, SummaryScope};
use crate::errors::StorageError;
use async_trait::async_trait;
use uuid::Uuid;

/// A place log entries are kept.
///
/// Entries arrive already sequenced. Implementations must answer queries
/// with the semantics of [`LogQuery`]: conjunctive filters, `(timestamp, id)`
/// ordering and cursor seek.
#[async_trait]
pub trait LogBackend: Send + Sync {
    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Persists one entry.
    async fn append(&self, entry: &LogEntry) -> Result<(), StorageError>;

    /// Persists several entries in order and returns how many were
    /// refused. A refused entry does not stop the rest of the batch.
    async fn append_batch(&self, entries: &[LogEntry]) -> Result<usize, StorageError> {
        let mut refused = 0;
        for entry in entries {
            match self.append(entry).await {
                Ok(()) => {}
                Err(StorageError::Refused(_)) => refused += 1,
                Err(e) => return Err(e),
            }
        }
        Ok(refused)
    }

    /// Answers a query. `limit` is already resolved by the caller.
    async fn query(&self, query: &LogQuery, limit: usize) -> Result<LogPage, StorageError>;

    /// Aggregates counts over a scope.
    async fn summary(&self, scope: &SummaryScope) -> Result<LogSummary, StorageError>;

    /// Highest sequence number stored for an execution.
    async fn last_sequence(&self, execution_id: Uuid) -> Result<Option<u64>, StorageError>;

    /// Removes every entry of an execution and returns how many were removed.
    async fn delete_execution(&self, execution_id: Uuid) -> Result<u64, StorageError>;
}
