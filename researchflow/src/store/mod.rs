//! Task persistence.
//!
//! The [`TaskStore`] trait is the only durable state the orchestrator
//! depends on. Every write carries the version the writer read; a mismatch
//! is rejected with [`StoreError::VersionConflict`] so concurrent writers
//! cannot silently overwrite each other.

mod memory;
mod model;

pub use memory::InMemoryTaskStore;
pub use model::{StageExecution, TaskInstance};

use crate::core::{StageStatus, TaskId, TaskStatus};
use crate::errors::StoreError;
use crate::workflow::{StageSpec, WorkflowDefinition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Whether a stage may be dispatched, given its upstream records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Every dependency is satisfied.
    Ready,
    /// A required upstream stage ended without succeeding.
    Blocked {
        /// The upstream stage.
        dependency: String,
        /// Its final status.
        status: StageStatus,
    },
    /// At least one upstream stage has not finished.
    Waiting,
}

/// Decides readiness of `spec` against the records of `task`.
///
/// A required edge is satisfied only by a Succeeded upstream; an optional
/// edge by any terminal upstream state. A required edge whose upstream is
/// terminal but not Succeeded blocks the stage for good.
#[must_use]
pub fn assess_readiness(task: &TaskInstance, spec: &StageSpec) -> Readiness {
    let mut waiting = false;
    for dep in &spec.dependencies {
        let upstream = task.stage(&dep.stage);
        let terminal = upstream.is_some_and(StageExecution::is_terminal);
        let status = task.stage_status(&dep.stage);

        if !terminal {
            waiting = true;
        } else if !dep.is_optional() && !status.is_success() {
            return Readiness::Blocked {
                dependency: dep.stage.clone(),
                status,
            };
        }
    }
    if waiting {
        Readiness::Waiting
    } else {
        Readiness::Ready
    }
}

/// Storage backend for tasks and their stage executions.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Stores a new task.
    async fn create_task(&self, task: TaskInstance) -> Result<(), StoreError>;

    /// Reads a task snapshot.
    async fn read_task(&self, task_id: TaskId) -> Result<TaskInstance, StoreError>;

    /// Inserts or replaces one stage execution record.
    ///
    /// Returns the new version.
    async fn update_stage_execution(
        &self,
        task_id: TaskId,
        execution: StageExecution,
        expected_version: u64,
    ) -> Result<u64, StoreError>;

    /// Replaces the whole task record.
    ///
    /// Returns the new version.
    async fn update_task(&self, task: &TaskInstance, expected_version: u64)
        -> Result<u64, StoreError>;

    /// Lists tasks, optionally filtered by status, oldest first.
    async fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<TaskInstance>;

    /// Removes terminal tasks that completed before `completed_before`.
    ///
    /// Returns the number of tasks removed.
    async fn purge(&self, completed_before: DateTime<Utc>) -> usize;

    /// Returns the unstarted stages whose dependencies are all satisfied,
    /// in topological order. Only stages listed here are dispatched.
    async fn list_ready_candidates(
        &self,
        task_id: TaskId,
        definition: &WorkflowDefinition,
    ) -> Result<Vec<String>, StoreError> {
        let task = self.read_task(task_id).await?;
        Ok(definition
            .topological_order()
            .iter()
            .filter(|id| task.stage_status(id).is_unstarted())
            .filter_map(|id| definition.stage(id))
            .filter(|spec| assess_readiness(&task, spec) == Readiness::Ready)
            .map(|spec| spec.id.clone())
            .collect())
    }
}
