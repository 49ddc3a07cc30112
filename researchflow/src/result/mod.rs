//! Result assembly for terminal tasks.

use crate::core::{StageStatus, TaskId, TaskStatus};
use crate::errors::{NotTerminalError, OrchestratorError};
use crate::store::{TaskInstance, TaskStore};
use crate::workflow::WorkflowDefinition;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Error details for a stage that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageErrorRecord {
    /// The stage.
    pub stage_id: String,
    /// Its final status (Failed or Skipped).
    pub status: StageStatus,
    /// The last error or skip reason.
    pub error: Option<String>,
    /// Attempts made.
    pub attempts: u32,
    /// Whether the stage was required for completion.
    pub required: bool,
}

/// The final deliverable of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchResult {
    /// The task.
    pub task_id: TaskId,
    /// Workflow name.
    pub workflow: String,
    /// Terminal status of the task.
    pub status: TaskStatus,
    /// Outputs of succeeded required stages.
    pub outputs: BTreeMap<String, Value>,
    /// Outputs of succeeded optional stages.
    pub optional_outputs: BTreeMap<String, Value>,
    /// Failed and skipped stages, ordered by stage identifier.
    pub errors: Vec<StageErrorRecord>,
    /// When the task finished.
    pub completed_at: Option<DateTime<Utc>>,
}

impl ResearchResult {
    /// Assembles the result from a terminal task record.
    #[must_use]
    pub fn from_task(task: &TaskInstance, definition: &WorkflowDefinition) -> Self {
        let mut outputs = BTreeMap::new();
        let mut optional_outputs = BTreeMap::new();
        let mut errors = Vec::new();

        for (stage_id, exec) in &task.stages {
            let required = definition.stage(stage_id).map_or(true, |s| s.required);
            match exec.status {
                StageStatus::Succeeded => {
                    let output = exec.output.clone().unwrap_or(Value::Null);
                    if required {
                        outputs.insert(stage_id.clone(), output);
                    } else {
                        optional_outputs.insert(stage_id.clone(), output);
                    }
                }
                StageStatus::Failed | StageStatus::Skipped => errors.push(StageErrorRecord {
                    stage_id: stage_id.clone(),
                    status: exec.status,
                    error: exec.last_error.clone(),
                    attempts: exec.attempts,
                    required,
                }),
                _ => {}
            }
        }

        Self {
            task_id: task.id,
            workflow: task.workflow.clone(),
            status: task.status,
            outputs,
            optional_outputs,
            errors,
            completed_at: task.completed_at,
        }
    }

    /// Returns errors of required stages only.
    pub fn required_errors(&self) -> impl Iterator<Item = &StageErrorRecord> {
        self.errors.iter().filter(|e| e.required)
    }

    /// Serializes the result to canonical JSON bytes.
    #[must_use]
    pub fn to_json_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// SHA-256 fingerprint of the canonical JSON form.
    #[must_use]
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.to_json_bytes()))
    }
}

/// Builds and caches results of terminal tasks.
pub struct ResultAggregator {
    store: Arc<dyn TaskStore>,
    cache: DashMap<TaskId, Arc<ResearchResult>>,
}

impl ResultAggregator {
    /// Creates an aggregator reading from `store`.
    #[must_use]
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
        }
    }

    /// Returns the result of a terminal task, building it on first use.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::NotTerminal` while the task is still
    /// running and `OrchestratorError::Store` if the task is unknown.
    pub async fn build_result(
        &self,
        task_id: TaskId,
        definition: &WorkflowDefinition,
    ) -> Result<Arc<ResearchResult>, OrchestratorError> {
        if let Some(cached) = self.cache.get(&task_id) {
            return Ok(cached.clone());
        }

        let task = self.store.read_task(task_id).await?;
        if !task.is_terminal() {
            return Err(NotTerminalError {
                task_id,
                status: task.status,
            }
            .into());
        }

        let result = Arc::new(ResearchResult::from_task(&task, definition));
        debug!(task_id = %task_id, status = %result.status, errors = result.errors.len(), "Result built");
        Ok(self.cache.entry(task_id).or_insert(result).clone())
    }

    /// Drops a cached result.
    pub fn evict(&self, task_id: TaskId) -> bool {
        self.cache.remove(&task_id).is_some()
    }
}

impl std::fmt::Debug for ResultAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultAggregator")
            .field("cached", &self.cache.len())
            .finish()
    }
}
