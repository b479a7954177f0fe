//! Execution records and their persistence.

mod record;
mod store;

pub use record::{ExecutionRecord, MAX_PROGRESS_BEFORE_COMPLETION};
pub use store::{ExecutionRecordStore, InMemoryRecordStore};
