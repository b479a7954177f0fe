//! Execution log store.
//!
//! Structured, append-only log lines per execution, with filtered and
//! cursor-paginated reads, summaries and live tails. See
//! [`ExecutionLogStore`] for the write and read policy.

mod backend;
mod entry;
mod memory;
mod query;
mod replay;
mod store;
mod tail;

pub use backend::LogBackend;
pub use entry::{LogEntry, LogLevel};
pub use memory::InMemoryLogBackend;
pub use query::{LogPage, LogQuery, LogSummary, SortOrder, SummaryScope};
pub use replay::{ReplayBuffer, ReplayMetrics, ReplaySnapshot};
pub use store::{ExecutionLogStore, LOG_STORE_SERVICE};
pub use tail::{NeverTerminal, TailMode, TailSession, TerminalProbe, WatchGuard, WatchRegistry};
