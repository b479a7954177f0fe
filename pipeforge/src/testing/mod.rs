//! Testing utilities for pipeforge pipelines.
//!
//! This module provides:
//! - Scripted stage agents and a log backend that can be switched off
//! - Blueprint and tenant fixtures
//! - Assertions over records and progress events

mod assertions;
pub mod fixtures;
mod mocks;

pub use assertions::{assert_progress_monotonic, assert_stage_prefix};
pub use mocks::{CallCounter, FlakyLogBackend, ScriptStep, ScriptedAgent};
