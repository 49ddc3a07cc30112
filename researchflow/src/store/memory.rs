//! In-memory task store.

use super::{StageExecution, TaskInstance, TaskStore};
use crate::core::{TaskId, TaskStatus};
use crate::errors::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

/// Task store backed by a concurrent hash map.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: DashMap<TaskId, TaskInstance>,
}

impl InMemoryTaskStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

fn check_version(task: &TaskInstance, expected: u64) -> Result<(), StoreError> {
    if task.version == expected {
        Ok(())
    } else {
        Err(StoreError::VersionConflict {
            task_id: task.id,
            expected,
            actual: task.version,
        })
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(&self, task: TaskInstance) -> Result<(), StoreError> {
        match self.tasks.entry(task.id) {
            Entry::Occupied(_) => Err(StoreError::TaskExists(task.id)),
            Entry::Vacant(slot) => {
                debug!(task_id = %task.id, workflow = %task.workflow, "Task stored");
                slot.insert(task);
                Ok(())
            }
        }
    }

    async fn read_task(&self, task_id: TaskId) -> Result<TaskInstance, StoreError> {
        self.tasks
            .get(&task_id)
            .map(|t| t.value().clone())
            .ok_or(StoreError::TaskNotFound(task_id))
    }

    async fn update_stage_execution(
        &self,
        task_id: TaskId,
        execution: StageExecution,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let mut task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        check_version(&task, expected_version)?;

        task.stages.insert(execution.stage_id.clone(), execution);
        task.recompute_progress();
        task.version += 1;
        task.updated_at = Utc::now();
        Ok(task.version)
    }

    async fn update_task(
        &self,
        task: &TaskInstance,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let mut stored = self
            .tasks
            .get_mut(&task.id)
            .ok_or(StoreError::TaskNotFound(task.id))?;
        check_version(&stored, expected_version)?;

        let mut next = task.clone();
        next.recompute_progress();
        next.version = expected_version + 1;
        next.updated_at = Utc::now();
        *stored = next;
        Ok(stored.version)
    }

    async fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<TaskInstance> {
        let mut tasks: Vec<TaskInstance> = self
            .tasks
            .iter()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .map(|t| t.value().clone())
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    async fn purge(&self, completed_before: DateTime<Utc>) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, task| {
            !(task.is_terminal() && task.completed_at.is_some_and(|at| at < completed_before))
        });
        let removed = before.saturating_sub(self.tasks.len());
        if removed > 0 {
            debug!(removed, "Purged terminal tasks");
        }
        removed
    }
}
