//! Level-triggered task evaluation.
//!
//! `evaluate` re-scans every stage of a task under the task's transition
//! lock and drives it as far as the current records allow: it starts the
//! task, promotes stages whose dependencies are satisfied, skips stages that
//! can never run, dispatches ready stages, handles cancellation and finally
//! settles the task. Every change is persisted before its event is
//! published.

use super::runtime::{Dispatch, TaskRuntime};
use super::Inner;
use crate::core::{EventKind, StageStatus, TaskId, TaskStatus};
use crate::errors::{OrchestratorError, StoreError, TransitionError};
use crate::store::{assess_readiness, Readiness, StageExecution, TaskInstance};
use crate::workflow::{FailureMode, WorkflowDefinition};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

impl Inner {
    pub(crate) fn runtime(&self, task_id: TaskId) -> Option<Arc<TaskRuntime>> {
        self.runtimes.get(&task_id).map(|rt| Arc::clone(rt.value()))
    }

    pub(crate) fn spawn_evaluate(self: &Arc<Self>, task_id: TaskId) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.evaluate_logged(task_id).await;
        });
    }

    pub(crate) async fn evaluate_logged(&self, task_id: TaskId) {
        if let Err(e) = self.evaluate(task_id).await {
            error!(task_id = %task_id, error = %e, "Task evaluation failed");
        }
    }

    pub(crate) async fn evaluate(&self, task_id: TaskId) -> Result<(), OrchestratorError> {
        let Some(rt) = self.runtime(task_id) else {
            return Ok(());
        };
        let _guard = rt.lock.lock().await;

        let mut task = self.store.read_task(task_id).await?;
        if task.is_terminal() {
            self.runtimes.remove(&task_id);
            return Ok(());
        }

        if rt.cancel.is_cancelled() {
            return self.drive_cancellation(&rt, &mut task).await;
        }

        if task.status == TaskStatus::Pending {
            self.set_task_status(&mut task, TaskStatus::Running).await?;
            self.publish(
                task_id,
                None,
                EventKind::TaskStarted,
                json!({ "workflow": task.workflow }),
            );
        }

        let definition = Arc::clone(&rt.workflow.definition);
        let mut halted = halting_failure(&task, &definition);
        if halted.is_none() {
            self.advance_pending(&mut task, &definition).await?;
            halted = halting_failure(&task, &definition);
        }

        match halted {
            Some(cause) => self.halt(&mut task, &definition, &cause).await?,
            None => self.dispatch_ready(&rt, &task, &definition).await?,
        }

        let settled = definition
            .stages()
            .iter()
            .all(|spec| task.stage_is_terminal(&spec.id));
        if settled && rt.in_flight_count() == 0 {
            self.finish(&mut task, &definition).await?;
        }
        Ok(())
    }

    /// Promotes or skips every Pending stage, in topological order so a skip
    /// cascades within one pass.
    async fn advance_pending(
        &self,
        task: &mut TaskInstance,
        definition: &WorkflowDefinition,
    ) -> Result<(), OrchestratorError> {
        for stage_id in definition.topological_order() {
            if task.stage_status(stage_id) != StageStatus::Pending {
                continue;
            }
            let Some(spec) = definition.stage(stage_id) else {
                continue;
            };
            match assess_readiness(task, spec) {
                Readiness::Ready => {
                    self.update_stage(task, stage_id, |e| e.transition(StageStatus::Ready))
                        .await?;
                }
                Readiness::Blocked { dependency, status } => {
                    let reason = format!("required dependency '{dependency}' {status}");
                    self.skip_stage(task, stage_id, reason).await?;
                }
                Readiness::Waiting => {}
            }
        }
        Ok(())
    }

    /// Stops a fail-fast task: pending retries are abandoned and nothing that
    /// has not started will run.
    async fn halt(
        &self,
        task: &mut TaskInstance,
        definition: &WorkflowDefinition,
        cause: &str,
    ) -> Result<(), OrchestratorError> {
        for stage_id in definition.topological_order() {
            if task.stage(stage_id).is_some_and(StageExecution::is_awaiting_retry) {
                self.abandon_retry(task, stage_id).await?;
            } else if task.stage_status(stage_id).is_unstarted() {
                let reason = format!("workflow halted after required stage '{cause}' failed");
                self.skip_stage(task, stage_id, reason).await?;
            }
        }
        Ok(())
    }

    /// Claims and enqueues Ready stages the store reports as dispatchable,
    /// up to the task's parallelism limit.
    async fn dispatch_ready(
        &self,
        rt: &TaskRuntime,
        task: &TaskInstance,
        definition: &WorkflowDefinition,
    ) -> Result<(), OrchestratorError> {
        let candidates: Vec<String> = self
            .store
            .list_ready_candidates(task.id, definition)
            .await?
            .into_iter()
            .filter(|id| task.stage_status(id) == StageStatus::Ready && !rt.is_in_flight(id))
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }

        for stage_id in rt.claim(candidates, self.config.max_concurrent_stages_per_task) {
            debug!(task_id = %task.id, stage = %stage_id, "Stage dispatched");
            let dispatch = Dispatch {
                task_id: task.id,
                stage_id: stage_id.clone(),
            };
            if self.queue.send(dispatch).is_err() {
                warn!(task_id = %task.id, stage = %stage_id, "Ready queue closed; dispatch dropped");
                rt.release(&stage_id);
            }
        }
        Ok(())
    }

    async fn drive_cancellation(
        &self,
        rt: &TaskRuntime,
        task: &mut TaskInstance,
    ) -> Result<(), OrchestratorError> {
        if matches!(task.status, TaskStatus::Pending | TaskStatus::Running) {
            let reason = rt.cancel.reason().unwrap_or_default();
            self.set_task_status(task, TaskStatus::Cancelling).await?;
            info!(task_id = %task.id, reason = %reason, "Task cancelling");
            self.publish(
                task.id,
                None,
                EventKind::TaskCancelling,
                json!({ "reason": reason, "in_flight": rt.in_flight_count() }),
            );
        }

        let waiting: Vec<String> = task
            .stages
            .values()
            .filter(|e| e.is_awaiting_retry())
            .map(|e| e.stage_id.clone())
            .collect();
        for stage_id in waiting {
            self.abandon_retry(task, &stage_id).await?;
        }

        if rt.in_flight_count() == 0 {
            task.completed_at = Some(Utc::now());
            self.set_task_status(task, TaskStatus::Cancelled).await?;
            info!(task_id = %task.id, "Task cancelled");
            self.publish(
                task.id,
                None,
                EventKind::TaskCancelled,
                json!({ "progress": task.progress }),
            );
            self.runtimes.remove(&task.id);
        }
        Ok(())
    }

    async fn finish(
        &self,
        task: &mut TaskInstance,
        definition: &WorkflowDefinition,
    ) -> Result<(), OrchestratorError> {
        let failed = definition
            .topological_order()
            .iter()
            .filter_map(|id| definition.stage(id))
            .find(|spec| spec.required && !task.stage_status(&spec.id).is_success())
            .map(|spec| spec.id.clone());

        task.completed_at = Some(Utc::now());
        if let Some(stage_id) = failed {
            let status = task.stage_status(&stage_id);
            let cause = task
                .stage(&stage_id)
                .and_then(|e| e.last_error.clone())
                .unwrap_or_else(|| "no error recorded".to_string());
            let message = format!("Required stage '{stage_id}' {status}: {cause}");
            task.error_message = Some(message.clone());
            self.set_task_status(task, TaskStatus::Failed).await?;
            warn!(task_id = %task.id, stage = %stage_id, "Task failed");
            self.publish(
                task.id,
                None,
                EventKind::TaskFailed,
                json!({ "stage": stage_id, "error": message }),
            );
        } else {
            self.set_task_status(task, TaskStatus::Completed).await?;
            info!(task_id = %task.id, workflow = %task.workflow, "Task completed");
            self.publish(
                task.id,
                None,
                EventKind::TaskCompleted,
                json!({ "stages": task.stages.len() }),
            );
        }
        self.runtimes.remove(&task.id);
        Ok(())
    }

    /// Puts a failed stage waiting for its backoff back on the ready path.
    pub(crate) async fn retry_stage(
        &self,
        task_id: TaskId,
        stage_id: &str,
    ) -> Result<(), OrchestratorError> {
        let Some(rt) = self.runtime(task_id) else {
            return Ok(());
        };
        {
            let _guard = rt.lock.lock().await;
            let mut task = self.store.read_task(task_id).await?;
            let waiting = task.stage(stage_id).is_some_and(StageExecution::is_awaiting_retry);
            if waiting && !task.is_terminal() && !rt.cancel.is_cancelled() {
                self.update_stage(&mut task, stage_id, |e| e.transition(StageStatus::Ready))
                    .await?;
                debug!(task_id = %task_id, stage = %stage_id, "Stage ready for retry");
            }
        }
        self.evaluate(task_id).await
    }

    async fn skip_stage(
        &self,
        task: &mut TaskInstance,
        stage_id: &str,
        reason: String,
    ) -> Result<(), OrchestratorError> {
        let recorded = reason.clone();
        self.update_stage(task, stage_id, move |e| {
            e.transition(StageStatus::Skipped)?;
            e.last_error = Some(recorded);
            Ok(())
        })
        .await?;
        info!(task_id = %task.id, stage = %stage_id, reason = %reason, "Stage skipped");
        self.publish(
            task.id,
            Some(stage_id),
            EventKind::StageSkipped,
            json!({ "reason": reason }),
        );
        Ok(())
    }

    /// Turns a failure that was waiting for a retry into a terminal one.
    async fn abandon_retry(
        &self,
        task: &mut TaskInstance,
        stage_id: &str,
    ) -> Result<(), OrchestratorError> {
        self.update_stage(task, stage_id, |e| {
            e.retry_at = None;
            Ok(())
        })
        .await?;
        debug!(task_id = %task.id, stage = %stage_id, "Pending retry abandoned");
        Ok(())
    }

    /// Applies `mutate` to a stage record (creating it if needed) and
    /// persists it.
    pub(crate) async fn update_stage<F>(
        &self,
        task: &mut TaskInstance,
        stage_id: &str,
        mutate: F,
    ) -> Result<StageExecution, OrchestratorError>
    where
        F: FnOnce(&mut StageExecution) -> Result<(), TransitionError> + Send,
    {
        let mut exec = task
            .stage(stage_id)
            .cloned()
            .unwrap_or_else(|| StageExecution::new(stage_id));
        mutate(&mut exec)?;
        self.persist_stage(task, exec.clone()).await?;
        Ok(exec)
    }

    async fn persist_stage(
        &self,
        task: &mut TaskInstance,
        exec: StageExecution,
    ) -> Result<(), OrchestratorError> {
        let mut conflicts = 0;
        loop {
            match self
                .store
                .update_stage_execution(task.id, exec.clone(), task.version)
                .await
            {
                Ok(version) => {
                    task.version = version;
                    task.updated_at = Utc::now();
                    task.stages.insert(exec.stage_id.clone(), exec);
                    task.recompute_progress();
                    return Ok(());
                }
                Err(StoreError::VersionConflict { .. })
                    if conflicts < self.config.store_conflict_retries =>
                {
                    conflicts += 1;
                    warn!(task_id = %task.id, stage = %exec.stage_id, conflicts, "Version conflict; re-reading task");
                    *task = self.store.read_task(task.id).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub(crate) async fn set_task_status(
        &self,
        task: &mut TaskInstance,
        to: TaskStatus,
    ) -> Result<(), OrchestratorError> {
        if !task.status.can_transition_to(to) {
            return Err(OrchestratorError::Internal(format!(
                "illegal task transition {} -> {to}",
                task.status
            )));
        }
        task.status = to;

        let mut conflicts = 0;
        loop {
            match self.store.update_task(task, task.version).await {
                Ok(version) => {
                    task.version = version;
                    task.updated_at = Utc::now();
                    return Ok(());
                }
                Err(StoreError::VersionConflict { .. })
                    if conflicts < self.config.store_conflict_retries =>
                {
                    conflicts += 1;
                    warn!(task_id = %task.id, conflicts, "Version conflict; re-reading task");
                    let mut fresh = self.store.read_task(task.id).await?;
                    fresh.status = task.status;
                    fresh.error_message = task.error_message.take();
                    fresh.completed_at = task.completed_at;
                    *task = fresh;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub(crate) fn publish(
        &self,
        task_id: TaskId,
        stage_id: Option<&str>,
        kind: EventKind,
        payload: Value,
    ) {
        self.bus.publish(task_id, stage_id, kind, payload);
    }
}

/// In fail-fast mode, the first required stage that ended without
/// succeeding.
pub(crate) fn halting_failure(task: &TaskInstance, definition: &WorkflowDefinition) -> Option<String> {
    if definition.failure_mode() != FailureMode::FailFast {
        return None;
    }
    definition
        .topological_order()
        .iter()
        .filter_map(|id| definition.stage(id))
        .find(|spec| {
            spec.required
                && task.stage_is_terminal(&spec.id)
                && !task.stage_status(&spec.id).is_success()
        })
        .map(|spec| spec.id.clone())
}
