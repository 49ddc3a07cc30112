//! Per-task, append-only event log with resumable subscriptions.

use super::EventSink;
use crate::core::{Event, EventKind, TaskId};
use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

/// A stream of events for one task, ending after the terminal sentinel.
pub type EventStream = BoxStream<'static, Event>;

struct TaskLog {
    events: RwLock<Vec<Event>>,
    latest: watch::Sender<u64>,
}

impl TaskLog {
    fn new() -> Self {
        let (latest, _) = watch::channel(0);
        Self {
            events: RwLock::new(Vec::new()),
            latest,
        }
    }
}

/// Publishes task events and serves them to any number of subscribers.
///
/// Each task has its own log; sequence numbers start at 1 and have no gaps.
/// Subscribers replay the log from the start (or from a resume point) and
/// then follow live publications, each at its own pace.
#[derive(Default)]
pub struct EventBus {
    logs: DashMap<TaskId, Arc<TaskLog>>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventBus {
    /// Creates a bus with no sinks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an external sink.
    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().push(sink);
    }

    /// Builder-style sink registration.
    #[must_use]
    pub fn with_sink(self, sink: Arc<dyn EventSink>) -> Self {
        self.add_sink(sink);
        self
    }

    fn log(&self, task_id: TaskId) -> Arc<TaskLog> {
        self.logs
            .entry(task_id)
            .or_insert_with(|| Arc::new(TaskLog::new()))
            .clone()
    }

    /// Creates an empty log for a task, so that subscriptions taken before
    /// its first event follow it. A no-op if the log exists.
    pub fn open(&self, task_id: TaskId) {
        self.log(task_id);
    }

    /// Appends an event to the task's log and wakes its subscribers.
    pub fn publish(
        &self,
        task_id: TaskId,
        stage_id: Option<&str>,
        kind: EventKind,
        payload: Value,
    ) -> Event {
        let log = self.log(task_id);
        let event = {
            let mut events = log.events.write();
            let event = Event {
                task_id,
                stage_id: stage_id.map(str::to_string),
                kind,
                sequence: events.len() as u64 + 1,
                timestamp: Utc::now(),
                payload,
            };
            events.push(event.clone());
            event
        };
        log.latest.send_replace(event.sequence);
        trace!(task_id = %task_id, sequence = event.sequence, kind = %kind, "Event published");

        let sinks = self.sinks.read().clone();
        for sink in sinks {
            sink.try_emit(&event);
        }
        event
    }

    /// Subscribes to a task's events.
    ///
    /// With `after = None` the stream replays from sequence 1; with
    /// `Some(n)` it resumes at sequence `n + 1`. The stream ends once the
    /// terminal event has been delivered. A task without a log gets an empty
    /// stream.
    #[must_use]
    pub fn subscribe(&self, task_id: TaskId, after: Option<u64>) -> EventStream {
        let Some(log) = self.logs.get(&task_id).map(|log| Arc::clone(log.value())) else {
            return stream::empty().boxed();
        };
        let rx = log.latest.subscribe();
        let cursor = usize::try_from(after.unwrap_or(0)).unwrap_or(usize::MAX);

        stream::unfold(
            (log, rx, cursor, false),
            |(log, mut rx, cursor, done)| async move {
                if done {
                    return None;
                }
                loop {
                    let next = log.events.read().get(cursor).cloned();
                    if let Some(event) = next {
                        let done = event.is_terminal();
                        return Some((event, (log, rx, cursor + 1, done)));
                    }
                    if rx.changed().await.is_err() {
                        return None;
                    }
                }
            },
        )
        .boxed()
    }

    /// Returns a snapshot of a task's log.
    #[must_use]
    pub fn events(&self, task_id: TaskId) -> Vec<Event> {
        self.logs
            .get(&task_id)
            .map(|log| log.events.read().clone())
            .unwrap_or_default()
    }

    /// Returns the highest sequence number published for a task.
    #[must_use]
    pub fn last_sequence(&self, task_id: TaskId) -> u64 {
        self.logs
            .get(&task_id)
            .map_or(0, |log| *log.latest.borrow())
    }

    /// Drops a task's log. Open subscriptions keep their own handle.
    pub fn remove(&self, task_id: TaskId) -> bool {
        self.logs.remove(&task_id).is_some()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("tasks", &self.logs.len())
            .field("sinks", &self.sinks.read().len())
            .finish()
    }
}
