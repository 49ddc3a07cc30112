//! Worker pool executing dispatched stages.

use super::runtime::{Dispatch, TaskRuntime};
use super::scheduler::halting_failure;
use super::Inner;
use crate::capability::{Capability, CapabilityInput};
use crate::core::{EventKind, StageStatus};
use crate::errors::{OrchestratorError, TimeoutError};
use crate::observability::SpanTimer;
use crate::workflow::StageSpec;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Shared receiving end of the ready queue.
pub(crate) type SharedReceiver = Arc<Mutex<mpsc::UnboundedReceiver<Dispatch>>>;

/// Pulls dispatches until the queue closes or shutdown is requested.
pub(crate) async fn worker_loop(inner: Arc<Inner>, rx: SharedReceiver, worker: usize) {
    debug!(worker, "Worker started");
    loop {
        let next = {
            let mut rx = tokio::select! {
                biased;
                () = inner.shutdown.cancelled() => break,
                rx = rx.lock() => rx,
            };
            tokio::select! {
                biased;
                () = inner.shutdown.cancelled() => None,
                dispatch = rx.recv() => dispatch,
            }
        };
        let Some(dispatch) = next else {
            break;
        };
        inner.run_dispatch(dispatch).await;
    }
    debug!(worker, "Worker stopped");
}

enum Outcome {
    Succeeded(Value),
    Failed { message: String, retryable: bool },
}

struct Started {
    spec: StageSpec,
    capability: Arc<dyn Capability>,
    input: CapabilityInput,
}

impl Inner {
    pub(crate) async fn run_dispatch(self: &Arc<Self>, dispatch: Dispatch) {
        let Some(rt) = self.runtime(dispatch.task_id) else {
            return;
        };
        if let Err(e) = self.execute(&rt, &dispatch.stage_id).await {
            error!(
                task_id = %dispatch.task_id,
                stage = %dispatch.stage_id,
                error = %e,
                "Stage execution failed"
            );
        }
        rt.release(&dispatch.stage_id);
        self.evaluate_logged(dispatch.task_id).await;
    }

    async fn execute(self: &Arc<Self>, rt: &TaskRuntime, stage_id: &str) -> Result<(), OrchestratorError> {
        let Some(started) = self.start_stage(rt, stage_id).await? else {
            return Ok(());
        };
        let Started {
            spec,
            capability,
            input,
        } = started;
        let attempt = input.attempt;

        let span = info_span!("stage", task_id = %rt.task_id, stage = %stage_id, attempt);
        let timer = SpanTimer::start(stage_id);
        let cancel = rt.cancel.clone();
        let mut call = tokio::spawn(async move { capability.invoke(input, cancel).await }.instrument(span));
        let outcome = match tokio::time::timeout(spec.timeout, &mut call).await {
            Ok(Ok(Ok(output))) => Outcome::Succeeded(output),
            Ok(Ok(Err(e))) => Outcome::Failed {
                retryable: e.is_retryable_or(spec.retry.retry_by_default),
                message: e.message,
            },
            Ok(Err(join)) => Outcome::Failed {
                message: if join.is_panic() {
                    format!("capability panicked in stage '{stage_id}'")
                } else {
                    format!("capability call for stage '{stage_id}' was aborted")
                },
                retryable: true,
            },
            Err(_) => {
                call.abort();
                Outcome::Failed {
                    message: TimeoutError::new(stage_id, spec.timeout).to_string(),
                    retryable: true,
                }
            }
        };
        let duration_ms = timer.finish();

        self.record_outcome(rt, &spec, attempt, outcome, duration_ms)
            .await
    }

    /// Moves a Ready stage to Running and assembles its input.
    ///
    /// Returns `None` if the stage is no longer eligible.
    async fn start_stage(
        &self,
        rt: &TaskRuntime,
        stage_id: &str,
    ) -> Result<Option<Started>, OrchestratorError> {
        let _guard = rt.lock.lock().await;
        let mut task = self.store.read_task(rt.task_id).await?;

        if rt.cancel.is_cancelled()
            || task.is_terminal()
            || task.stage_status(stage_id) != StageStatus::Ready
        {
            debug!(task_id = %rt.task_id, stage = %stage_id, "Dispatch no longer eligible");
            return Ok(None);
        }

        let spec = rt
            .definition()
            .stage(stage_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::Internal(format!("unknown stage '{stage_id}'")))?;
        let capability = rt.workflow.capability(stage_id).ok_or_else(|| {
            OrchestratorError::Internal(format!("no capability bound for stage '{stage_id}'"))
        })?;

        let exec = self
            .update_stage(&mut task, stage_id, |e| e.transition(StageStatus::Running))
            .await?;
        info!(task_id = %rt.task_id, stage = %stage_id, attempt = exec.attempts, "Stage started");
        self.publish(
            rt.task_id,
            Some(stage_id),
            EventKind::StageStarted,
            json!({ "attempt": exec.attempts, "capability": spec.capability.to_string() }),
        );

        let upstream: BTreeMap<String, Value> = spec
            .dependency_ids()
            .filter_map(|dep| {
                task.stage(dep)
                    .filter(|e| e.status == StageStatus::Succeeded)
                    .and_then(|e| e.output.clone())
                    .map(|output| (dep.to_string(), output))
            })
            .collect();

        let input = CapabilityInput {
            task_id: rt.task_id,
            stage_id: stage_id.to_string(),
            attempt: exec.attempts,
            request: task.request.clone(),
            upstream,
        };
        Ok(Some(Started {
            spec,
            capability,
            input,
        }))
    }

    async fn record_outcome(
        self: &Arc<Self>,
        rt: &TaskRuntime,
        spec: &StageSpec,
        attempt: u32,
        outcome: Outcome,
        duration_ms: u64,
    ) -> Result<(), OrchestratorError> {
        let _guard = rt.lock.lock().await;
        let mut task = self.store.read_task(rt.task_id).await?;
        let stage_id = spec.id.as_str();

        match outcome {
            Outcome::Succeeded(output) => {
                self.update_stage(&mut task, stage_id, move |e| {
                    e.transition(StageStatus::Succeeded)?;
                    e.output = Some(output);
                    e.last_error = None;
                    Ok(())
                })
                .await?;
                info!(task_id = %rt.task_id, stage = %stage_id, attempt, duration_ms, "Stage succeeded");
                self.publish(
                    rt.task_id,
                    Some(stage_id),
                    EventKind::StageSucceeded,
                    json!({ "attempt": attempt, "duration_ms": duration_ms }),
                );
            }
            Outcome::Failed { message, retryable } => {
                let will_retry = retryable
                    && spec.retry.allows_another_attempt(attempt)
                    && !rt.cancel.is_cancelled()
                    && halting_failure(&task, rt.definition()).is_none();
                let delay = will_retry.then(|| spec.retry.delay_for(attempt));
                let retry_at = delay.map(|d| {
                    Utc::now() + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
                });

                let recorded = message.clone();
                self.update_stage(&mut task, stage_id, move |e| {
                    e.transition(StageStatus::Failed)?;
                    e.last_error = Some(recorded);
                    e.retry_at = retry_at;
                    Ok(())
                })
                .await?;
                warn!(
                    task_id = %rt.task_id,
                    stage = %stage_id,
                    attempt,
                    duration_ms,
                    will_retry,
                    error = %message,
                    "Stage failed"
                );
                self.publish(
                    rt.task_id,
                    Some(stage_id),
                    EventKind::StageFailed,
                    json!({
                        "attempt": attempt,
                        "error": message,
                        "will_retry": will_retry,
                        "duration_ms": duration_ms,
                    }),
                );

                if let Some(delay) = delay {
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    self.publish(
                        rt.task_id,
                        Some(stage_id),
                        EventKind::StageRetrying,
                        json!({ "next_attempt": attempt + 1, "delay_ms": delay_ms }),
                    );
                    self.schedule_retry(rt, stage_id, delay);
                }
            }
        }
        Ok(())
    }

    fn schedule_retry(self: &Arc<Self>, rt: &TaskRuntime, stage_id: &str, delay: Duration) {
        let inner = Arc::clone(self);
        let task_id = rt.task_id;
        let stage_id = stage_id.to_string();
        let cancel = rt.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => {
                    if let Err(e) = inner.retry_stage(task_id, &stage_id).await {
                        error!(task_id = %task_id, stage = %stage_id, error = %e, "Retry failed");
                    }
                }
                () = cancel.cancelled() => {}
                () = inner.shutdown.cancelled() => {}
            }
        });
    }
}
