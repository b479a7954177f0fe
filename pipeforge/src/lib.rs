//! # Pipeforge
//!
//! Pipeline orchestration and telemetry core for staged project generation.
//!
//! A run takes a blueprint through a fixed sequence of stages. Each stage is
//! handled by a pluggable agent. Pipeforge provides:
//!
//! - **Orchestration**: fixed stage order, accumulated input, quality-gated
//!   retries with backoff, and per-stage timeouts
//! - **Execution records**: monotonic progress and terminal status,
//!   persisted per tenant
//! - **Execution logs**: append-only structured logs with filtered,
//!   cursor-paginated reads, summaries and live tails
//! - **Graceful degradation**: per-service circuit breakers with fallbacks
//!   around agents and storage
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pipeforge::prelude::*;
//!
//! let orchestrator = PipelineOrchestrator::builder()
//!     .config(PipeforgeConfig::from_env()?)
//!     .agents(my_agents())
//!     .build()?;
//!
//! let ctx = TenantContext::new("acme");
//! let handle = orchestrator.start_run(&ctx, "shop", blueprint).await?;
//! let outcome = handle.wait().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod agents;
pub mod blueprint;
pub mod config;
pub mod context;
pub mod core;
pub mod degradation;
pub mod errors;
pub mod events;
pub mod logs;
pub mod observability;
pub mod pipeline;
pub mod records;
pub mod testing;
pub mod utils;

#[cfg(feature = "sqlite")]
pub mod storage;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::agents::{
        AccumulatedInput, AsyncFnAgent, FnAgent, StageAgent, StageReporter,
    };
    pub use crate::blueprint::Blueprint;
    pub use crate::config::{
        CircuitBreakerConfig, LogStoreConfig, OrchestratorConfig, PipeforgeConfig,
    };
    pub use crate::context::TenantContext;
    pub use crate::core::{
        AgentType, ExecutionStatus, FileArtifact, GenerationProgress, QualityCheck,
        QualityReport, StageResult, StageStatus,
    };
    pub use crate::degradation::{CircuitPhase, DegradationManager, ServiceHealth, ServiceSummary};
    pub use crate::errors::{
        ConfigurationError, ErrorInfo, PipeforgeError, StorageError, ValidationError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::logs::{
        LogEntry, LogLevel, LogPage, LogQuery, LogSummary, SortOrder, SummaryScope, TailMode,
    };
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{PipelineOrchestrator, RetryPolicy, RunHandle, RunOutcome};
    pub use crate::records::ExecutionRecord;
    pub use crate::utils::{generate_uuid, iso_timestamp, Timestamp};
}
