//! In-memory coordination state of live tasks.

use crate::cancellation::CancellationToken;
use crate::capability::Capability;
use crate::core::TaskId;
use crate::workflow::WorkflowDefinition;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A workflow whose stages have been resolved against the registry.
#[derive(Debug)]
pub(crate) struct BoundWorkflow {
    pub(crate) definition: Arc<WorkflowDefinition>,
    pub(crate) capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl BoundWorkflow {
    pub(crate) fn capability(&self, stage_id: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(stage_id).cloned()
    }
}

/// A unit of work on the ready queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Dispatch {
    pub(crate) task_id: TaskId,
    pub(crate) stage_id: String,
}

/// Coordination state of one non-terminal task.
///
/// `lock` serializes every transition of the task's stages; `in_flight`
/// holds stages that were enqueued or are running, and bounds per-task
/// parallelism.
pub(crate) struct TaskRuntime {
    pub(crate) task_id: TaskId,
    pub(crate) workflow: Arc<BoundWorkflow>,
    pub(crate) lock: tokio::sync::Mutex<()>,
    pub(crate) cancel: CancellationToken,
    in_flight: Mutex<HashSet<String>>,
}

impl TaskRuntime {
    pub(crate) fn new(task_id: TaskId, workflow: Arc<BoundWorkflow>) -> Self {
        Self {
            task_id,
            workflow,
            lock: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn definition(&self) -> &WorkflowDefinition {
        &self.workflow.definition
    }

    pub(crate) fn is_in_flight(&self, stage_id: &str) -> bool {
        self.in_flight.lock().contains(stage_id)
    }

    pub(crate) fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Claims up to `limit - in_flight` of `candidates`, returning the claimed ones.
    pub(crate) fn claim(&self, candidates: Vec<String>, limit: usize) -> Vec<String> {
        let mut in_flight = self.in_flight.lock();
        let mut claimed = Vec::new();
        for stage in candidates {
            if in_flight.len() >= limit {
                break;
            }
            if in_flight.insert(stage.clone()) {
                claimed.push(stage);
            }
        }
        claimed
    }

    pub(crate) fn release(&self, stage_id: &str) {
        self.in_flight.lock().remove(stage_id);
    }
}

impl std::fmt::Debug for TaskRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRuntime")
            .field("task_id", &self.task_id)
            .field("workflow", &self.workflow.definition.name())
            .field("in_flight", &self.in_flight_count())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
