//! Circuit breakers around unreliable dependencies.
//!
//! A [`DegradationManager`] wraps zero-argument async operations keyed by a
//! service name. Three consecutive failures, or a window failure rate above
//! the configured threshold, open the breaker; while open, calls are skipped
//! and answered from a fallback. After the cool-down exactly one trial call
//! is admitted: success closes the breaker, failure reopens it.

mod circuit;
mod manager;

pub use circuit::{CircuitPhase, CircuitState, ServiceHealth};
pub use manager::{CallOutcome, DegradationManager, ServiceSummary};
