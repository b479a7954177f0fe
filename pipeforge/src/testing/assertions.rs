//! Assertions over records and lifecycle events.

use crate::events::{EventKind, PipelineEvent};
use crate::records::ExecutionRecord;

/// Asserts that the overall progress carried by progress events never
/// decreases and stays within [0, 100].
///
/// # Panics
///
/// Panics if a value is out of range or lower than the one before it.
pub fn assert_progress_monotonic(events: &[PipelineEvent]) {
    let mut last = 0.0_f64;
    for event in events.iter().filter(|e| e.kind == EventKind::ProgressUpdated) {
        let Some(value) = event.data.get("overall_progress").and_then(serde_json::Value::as_f64) else {
            panic!("progress event without overall_progress: {:?}", event.data);
        };
        assert!(
            (0.0..=100.0).contains(&value),
            "overall progress {value} out of range"
        );
        assert!(
            value >= last,
            "overall progress went backwards: {last} -> {value}"
        );
        last = value;
    }
}

/// Asserts that the completed stages are a prefix of the stage order.
///
/// # Panics
///
/// Panics if they are not.
pub fn assert_stage_prefix(record: &ExecutionRecord) {
    let done = &record.stages_completed;
    assert!(
        done.len() <= record.stage_order.len() && record.stage_order[..done.len()] == done[..],
        "stages_completed {done:?} is not a prefix of {:?}",
        record.stage_order
    );
}
