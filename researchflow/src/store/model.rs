//! Persisted task and stage records.

use crate::core::{StageStatus, TaskId, TaskStatus};
use crate::errors::TransitionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Execution record for one stage of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecution {
    /// The stage identifier.
    pub stage_id: String,
    /// Current status.
    pub status: StageStatus,
    /// Number of attempts started so far.
    pub attempts: u32,
    /// Error of the most recent failed attempt, or the skip reason.
    pub last_error: Option<String>,
    /// Output of the successful attempt.
    pub output: Option<Value>,
    /// Start of the most recent attempt.
    pub started_at: Option<DateTime<Utc>>,
    /// End of the most recent attempt (or the skip time).
    pub ended_at: Option<DateTime<Utc>>,
    /// When a failed stage becomes eligible again; `None` on a Failed stage
    /// means the failure is terminal.
    pub retry_at: Option<DateTime<Utc>>,
}

impl StageExecution {
    /// Creates a pending record.
    #[must_use]
    pub fn new(stage_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            status: StageStatus::Pending,
            attempts: 0,
            last_error: None,
            output: None,
            started_at: None,
            ended_at: None,
            retry_at: None,
        }
    }

    /// Moves the record to `to`, enforcing the stage state machine.
    ///
    /// Entering Running counts a new attempt; entering Ready clears any
    /// pending retry time.
    ///
    /// # Errors
    ///
    /// Returns a [`TransitionError`] for an illegal edge.
    pub fn transition(&mut self, to: StageStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                stage: self.stage_id.clone(),
                from: self.status,
                to,
            });
        }

        let now = Utc::now();
        match to {
            StageStatus::Ready => self.retry_at = None,
            StageStatus::Running => {
                self.attempts += 1;
                self.started_at = Some(now);
                self.ended_at = None;
            }
            StageStatus::Succeeded | StageStatus::Failed | StageStatus::Skipped => {
                self.ended_at = Some(now);
            }
            StageStatus::Pending => {}
        }
        self.status = to;
        Ok(())
    }

    /// Returns true once the stage can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self.status {
            StageStatus::Succeeded | StageStatus::Skipped => true,
            StageStatus::Failed => self.retry_at.is_none(),
            _ => false,
        }
    }

    /// Returns true while a failed stage waits for its backoff.
    #[must_use]
    pub fn is_awaiting_retry(&self) -> bool {
        self.status == StageStatus::Failed && self.retry_at.is_some()
    }
}

/// One execution of a workflow for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    /// Task identifier.
    pub id: TaskId,
    /// The request payload.
    pub request: Value,
    /// Name of the workflow being executed.
    pub workflow: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last write.
    pub updated_at: DateTime<Utc>,
    /// Time the task became terminal.
    pub completed_at: Option<DateTime<Utc>>,
    /// Current status.
    pub status: TaskStatus,
    /// Share of stages in a terminal state, 0-100.
    pub progress: u8,
    /// First required-stage error of a failed task.
    pub error_message: Option<String>,
    /// Execution records, created lazily per stage.
    pub stages: BTreeMap<String, StageExecution>,
    /// Number of stages in the workflow.
    pub total_stages: usize,
    /// Optimistic concurrency token, incremented on every write.
    pub version: u64,
}

impl TaskInstance {
    /// Creates a pending task.
    #[must_use]
    pub fn new(request: Value, workflow: impl Into<String>, total_stages: usize) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            request,
            workflow: workflow.into(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            status: TaskStatus::Pending,
            progress: 0,
            error_message: None,
            stages: BTreeMap::new(),
            total_stages,
            version: 0,
        }
    }

    /// Returns a stage's execution record, if it has one yet.
    #[must_use]
    pub fn stage(&self, id: &str) -> Option<&StageExecution> {
        self.stages.get(id)
    }

    /// Returns a stage's status; stages without a record are Pending.
    #[must_use]
    pub fn stage_status(&self, id: &str) -> StageStatus {
        self.stages.get(id).map_or(StageStatus::Pending, |s| s.status)
    }

    /// Returns true if the stage has a terminal record.
    #[must_use]
    pub fn stage_is_terminal(&self, id: &str) -> bool {
        self.stages.get(id).is_some_and(StageExecution::is_terminal)
    }

    /// Returns true once the task has reached a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Recomputes `progress` from the stage records.
    pub fn recompute_progress(&mut self) {
        if self.total_stages == 0 {
            self.progress = 0;
            return;
        }
        let done = self.stages.values().filter(|s| s.is_terminal()).count();
        let pct = (done * 100) / self.total_stages;
        self.progress = u8::try_from(pct.min(100)).unwrap_or(100);
    }
}
