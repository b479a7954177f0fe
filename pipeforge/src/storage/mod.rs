//! Durable storage backends.
//!
//! [`SqliteStore`] keeps execution records and execution logs in one SQLite
//! database. It implements both [`ExecutionRecordStore`] and [`LogBackend`],
//! so a single handle can be given to the orchestrator builder.
//!
//! [`ExecutionRecordStore`]: crate::records::ExecutionRecordStore
//! [`LogBackend`]: crate::logs::LogBackend

mod sqlite;

pub use sqlite::SqliteStore;
