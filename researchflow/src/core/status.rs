//! Task and stage status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Overall status of a research task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Submitted, no stage evaluated yet.
    #[default]
    Pending,
    /// Stages are being evaluated and dispatched.
    Running,
    /// Cancellation requested; waiting for in-flight calls to report.
    Cancelling,
    /// Every required stage succeeded.
    Completed,
    /// A required stage terminally failed or was skipped.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Cancelling => write!(f, "cancelling"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl TaskStatus {
    /// Returns true if no further transition can happen.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the task state machine allows moving to `next`.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Cancelling)
                | (Self::Running, Self::Cancelling | Self::Completed | Self::Failed)
                | (Self::Cancelling, Self::Cancelled)
        )
    }
}

/// Execution status of a single stage.
///
/// `Failed` covers both a failure awaiting its retry and a terminal failure;
/// the distinction lives on the execution record (`retry_at`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Dependencies not yet satisfied.
    #[default]
    Pending,
    /// Dependencies satisfied; may be dispatched.
    Ready,
    /// A capability call is in flight.
    Running,
    /// The capability returned an output.
    Succeeded,
    /// The capability failed or timed out.
    Failed,
    /// A required upstream dependency can never succeed.
    Skipped,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl StageStatus {
    /// Returns true if the stage state machine allows moving to `next`.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Ready | Self::Skipped)
                | (Self::Ready, Self::Running | Self::Skipped)
                | (Self::Running, Self::Succeeded | Self::Failed)
                | (Self::Failed, Self::Ready)
        )
    }

    /// Returns true if the stage has produced a usable output.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Returns true if the stage has not been dispatched yet.
    #[must_use]
    pub const fn is_unstarted(&self) -> bool {
        matches!(self, Self::Pending | Self::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_display() {
        assert_eq!(TaskStatus::Pending.to_string(), "pending");
        assert_eq!(TaskStatus::Cancelling.to_string(), "cancelling");
        assert_eq!(TaskStatus::Completed.to_string(), "completed");
    }

    #[test]
    fn test_task_status_is_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Cancelling.is_terminal());
    }

    #[test]
    fn test_task_status_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Cancelling));
        assert!(TaskStatus::Cancelling.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Cancelling.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn test_stage_status_transitions() {
        use StageStatus::*;

        assert!(Pending.can_transition_to(Ready));
        assert!(Pending.can_transition_to(Skipped));
        assert!(Ready.can_transition_to(Running));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Ready));

        assert!(!Pending.can_transition_to(Running));
        assert!(!Succeeded.can_transition_to(Ready));
        assert!(!Skipped.can_transition_to(Ready));
        assert!(!Running.can_transition_to(Skipped));
        assert!(!Failed.can_transition_to(Succeeded));
    }

    #[test]
    fn test_stage_status_serialize() {
        let json = serde_json::to_string(&StageStatus::Succeeded).unwrap();
        assert_eq!(json, r#""succeeded""#);

        let status: StageStatus = serde_json::from_str(r#""skipped""#).unwrap();
        assert_eq!(status, StageStatus::Skipped);
    }
}
