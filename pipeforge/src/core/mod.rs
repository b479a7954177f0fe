//! Core domain model types for pipeforge.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Stage identifiers and status enums
//! - Stage results and quality reports
//! - File artifacts and progress snapshots

mod artifact;
mod progress;
mod result;
mod status;

pub use artifact::FileArtifact;
pub use progress::GenerationProgress;
pub use result::{QualityCheck, QualityReport, StageResult};
pub use status::{AgentType, ExecutionStatus, StageStatus};
