//! Pipeline registration and execution.
//!
//! This module provides:
//! - The stage registry with its fail-fast validation
//! - The quality gate
//! - Retry delay policies
//! - The orchestrator that drives runs

mod gate;
mod integration_tests;
mod orchestrator;
mod registry;
mod retry;

pub use gate::{GateDecision, QualityGate};
pub use orchestrator::{
    agent_service, PipelineOrchestrator, PipelineOrchestratorBuilder, RunHandle, RunOutcome,
    SharedRecord, RECORD_STORE_SERVICE,
};
pub use registry::{codes, StageRegistry, StageRegistryBuilder};
pub use retry::{BackoffStrategy, JitterStrategy, RetryPolicy};
