//! Progress events published for every task state change.

use super::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of state change an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// The task left Pending.
    TaskStarted,
    /// A stage moved to Running.
    StageStarted,
    /// A stage produced its output.
    StageSucceeded,
    /// A stage attempt failed (terminal or not).
    StageFailed,
    /// A failed stage was scheduled for another attempt.
    StageRetrying,
    /// A stage was skipped because an upstream dependency failed.
    StageSkipped,
    /// Cancellation was requested.
    TaskCancelling,
    /// Every required stage succeeded.
    TaskCompleted,
    /// A required stage terminally failed or was skipped.
    TaskFailed,
    /// Cancellation finished.
    TaskCancelled,
}

impl EventKind {
    /// Returns true for the sentinel kinds that close a task's event log.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::TaskCompleted | Self::TaskFailed | Self::TaskCancelled
        )
    }

    /// Returns true for task-level (stage-less) events.
    #[must_use]
    pub const fn is_task_level(&self) -> bool {
        matches!(
            self,
            Self::TaskStarted
                | Self::TaskCancelling
                | Self::TaskCompleted
                | Self::TaskFailed
                | Self::TaskCancelled
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TaskStarted => "task.started",
            Self::StageStarted => "stage.started",
            Self::StageSucceeded => "stage.succeeded",
            Self::StageFailed => "stage.failed",
            Self::StageRetrying => "stage.retrying",
            Self::StageSkipped => "stage.skipped",
            Self::TaskCancelling => "task.cancelling",
            Self::TaskCompleted => "task.completed",
            Self::TaskFailed => "task.failed",
            Self::TaskCancelled => "task.cancelled",
        };
        f.write_str(name)
    }
}

/// An immutable, sequence-numbered progress event.
///
/// Ordering by `sequence` is the only ordering guarantee; sequence numbers
/// start at 1 and are gap-free per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// The task this event belongs to.
    pub task_id: TaskId,
    /// The stage, for stage-level events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,
    /// What happened.
    pub kind: EventKind,
    /// Position in the task's event log.
    pub sequence: u64,
    /// When the event was published.
    pub timestamp: DateTime<Utc>,
    /// Kind-specific details.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    /// Returns true if this event closes the task's log.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}
