//! Event sink trait and implementations.

use crate::core::{Event, EventKind};
use async_trait::async_trait;
use tracing::{debug, info, Level};

/// Trait for external consumers of published events.
///
/// Sinks receive every event after it has been appended to the task log.
/// They are observers only: a slow or failing sink never affects ordering
/// or delivery to subscribers.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event: &Event) {
        self.try_emit(event);
    }

    /// Emits an event without blocking.
    ///
    /// Must not panic; errors are logged and suppressed.
    fn try_emit(&self, event: &Event);
}

/// A no-op event sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn try_emit(&self, _event: &Event) {}
}

/// An event sink that logs events using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a new logging event sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    /// Creates an info-level logging sink.
    #[must_use]
    pub fn info() -> Self {
        Self::new(Level::INFO)
    }

    fn log_event(&self, event: &Event) {
        let stage = event.stage_id.as_deref().unwrap_or("-");
        if self.level == Level::DEBUG {
            debug!(
                task_id = %event.task_id,
                stage = %stage,
                sequence = event.sequence,
                payload = %event.payload,
                "Event: {}", event.kind
            );
        } else {
            info!(
                task_id = %event.task_id,
                stage = %stage,
                sequence = event.sequence,
                payload = %event.payload,
                "Event: {}", event.kind
            );
        }
    }
}

impl EventSink for LoggingEventSink {
    fn try_emit(&self, event: &Event) {
        self.log_event(event);
    }
}

/// A collecting event sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<Event>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
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

    /// Returns events of one kind.
    #[must_use]
    pub fn events_of_kind(&self, kind: EventKind) -> Vec<Event> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }
}

impl EventSink for CollectingEventSink {
    fn try_emit(&self, event: &Event) {
        self.events.write().push(event.clone());
    }
}
