//! Event sink trait and implementations.

use super::{EventKind, PipelineEvent};
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

/// Receives pipeline lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event: PipelineEvent) {
        self.try_emit(event);
    }

    /// Emits an event without blocking. Must never panic or fail.
    fn try_emit(&self, event: PipelineEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn try_emit(&self, _event: PipelineEvent) {}
}

/// Forwards events to `tracing`, at a level derived from the event kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventSink {
    verbose: bool,
}

impl LoggingEventSink {
    /// Creates a sink that also logs `progress.updated` events at debug level.
    #[must_use]
    pub fn verbose() -> Self {
        Self { verbose: true }
    }
}

impl EventSink for LoggingEventSink {
    fn try_emit(&self, event: PipelineEvent) {
        let execution_id = event.execution_id.map(|id| id.to_string()).unwrap_or_default();
        match event.kind {
            EventKind::ProgressUpdated => {
                if self.verbose {
                    debug!(event_type = %event.kind, execution_id = %execution_id, data = %event.data, "pipeline event");
                }
            }
            EventKind::RunFailed => {
                error!(event_type = %event.kind, execution_id = %execution_id, data = %event.data, "pipeline event");
            }
            EventKind::StageRetry | EventKind::CircuitOpened => {
                warn!(event_type = %event.kind, execution_id = %execution_id, data = %event.data, "pipeline event");
            }
            _ => {
                info!(event_type = %event.kind, execution_id = %execution_id, data = %event.data, "pipeline event");
            }
        }
    }
}

/// Buffers events in memory for inspection in tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<PipelineEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns the events of one kind, in emission order.
    #[must_use]
    pub fn events_of_kind(&self, kind: EventKind) -> Vec<PipelineEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Returns the kinds of all events, in emission order.
    #[must_use]
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.read().iter().map(|e| e.kind).collect()
    }
}

impl EventSink for CollectingEventSink {
    fn try_emit(&self, event: PipelineEvent) {
        self.events.write().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn event(kind: EventKind) -> PipelineEvent {
        PipelineEvent::for_execution(kind, Uuid::now_v7(), serde_json::json!({"stage": "backend"}))
    }

    #[tokio::test]
    async fn test_noop_and_logging_sinks_do_not_panic() {
        NoOpEventSink.emit(event(EventKind::RunStarted)).await;
        LoggingEventSink::default().emit(event(EventKind::RunFailed)).await;
        LoggingEventSink::verbose().try_emit(event(EventKind::ProgressUpdated));
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(event(EventKind::StageStarted)).await;
        sink.try_emit(event(EventKind::StageRetry));
        sink.try_emit(event(EventKind::StageStarted));

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.events_of_kind(EventKind::StageStarted).len(), 2);
        assert_eq!(sink.kinds()[1], EventKind::StageRetry);

        sink.clear();
        assert!(sink.is_empty());
    }
}
