//! Task orchestration.
//!
//! The [`Orchestrator`] accepts research requests, drives each task through
//! its workflow's stage graph and exposes progress events and final results.
//!
//! Scheduling is level-triggered: after every transition the owning task is
//! re-evaluated under its transition lock, ready stages are pushed on a
//! shared queue and a fixed pool of workers invokes the bound capabilities.

mod runtime;
mod scheduler;
mod worker;

#[cfg(test)]
mod integration_tests;

use crate::cancellation::CancellationToken;
use crate::capability::CapabilityRegistry;
use crate::config::OrchestratorConfig;
use crate::core::{TaskId, TaskStatus};
use crate::errors::{GraphError, OrchestratorError};
use crate::events::{EventBus, EventStream};
use crate::request::ResearchRequest;
use crate::result::{ResearchResult, ResultAggregator};
use crate::store::{TaskInstance, TaskStore};
use crate::workflow::WorkflowDefinition;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use runtime::{BoundWorkflow, Dispatch, TaskRuntime};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Shared state of the orchestrator, its workers and timers.
pub(crate) struct Inner {
    pub(crate) config: OrchestratorConfig,
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) registry: Arc<CapabilityRegistry>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) results: ResultAggregator,
    pub(crate) workflows: DashMap<String, Arc<BoundWorkflow>>,
    pub(crate) runtimes: DashMap<TaskId, Arc<TaskRuntime>>,
    /// Definition each task was submitted under, kept until purge.
    pub(crate) definitions: DashMap<TaskId, Arc<WorkflowDefinition>>,
    pub(crate) queue: mpsc::UnboundedSender<Dispatch>,
    pub(crate) shutdown: CancellationToken,
}

/// Runs research tasks against registered workflows.
///
/// Must be created inside a tokio runtime; the worker pool is spawned on
/// construction.
pub struct Orchestrator {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Creates an orchestrator with a fresh event bus.
    #[must_use]
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn TaskStore>,
        registry: Arc<CapabilityRegistry>,
    ) -> Self {
        Self::with_bus(config, store, registry, Arc::new(EventBus::new()))
    }

    /// Creates an orchestrator publishing to an existing bus.
    #[must_use]
    pub fn with_bus(
        config: OrchestratorConfig,
        store: Arc<dyn TaskStore>,
        registry: Arc<CapabilityRegistry>,
        bus: Arc<EventBus>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker_count = config.max_concurrent_stages.max(1);
        let inner = Arc::new(Inner {
            results: ResultAggregator::new(Arc::clone(&store)),
            config,
            store,
            registry,
            bus,
            workflows: DashMap::new(),
            runtimes: DashMap::new(),
            definitions: DashMap::new(),
            queue: tx,
            shutdown: CancellationToken::new(),
        });

        let rx: worker::SharedReceiver = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = (0..worker_count)
            .map(|index| tokio::spawn(worker::worker_loop(Arc::clone(&inner), Arc::clone(&rx), index)))
            .collect();
        info!(workers = worker_count, "Orchestrator started");

        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// The event bus tasks publish to.
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Registers a workflow, binding every stage to its capability.
    ///
    /// Re-registering a name replaces the previous definition for new
    /// submissions; running tasks keep the one they started with.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphError`] if the definition is invalid or a stage's
    /// capability kind is not registered.
    pub fn register_workflow(&self, definition: WorkflowDefinition) -> Result<(), GraphError> {
        definition.validate()?;

        let mut capabilities = HashMap::with_capacity(definition.stage_count());
        for spec in definition.stages() {
            let capability = self
                .inner
                .registry
                .resolve(&spec.capability)
                .ok_or_else(|| GraphError::missing_capability(&spec.id, &spec.capability.to_string()))?;
            capabilities.insert(spec.id.clone(), capability);
        }

        let name = definition.name().to_string();
        let bound = BoundWorkflow {
            definition: Arc::new(definition),
            capabilities,
        };
        if self.inner.workflows.insert(name.clone(), Arc::new(bound)).is_some() {
            warn!(workflow = %name, "Workflow re-registered");
        } else {
            info!(workflow = %name, "Workflow registered");
        }
        Ok(())
    }

    /// Returns a registered workflow definition.
    #[must_use]
    pub fn workflow(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.inner
            .workflows
            .get(name)
            .map(|w| Arc::clone(&w.definition))
    }

    /// Submits a raw request payload for execution.
    ///
    /// The task is stored as Pending and evaluation is scheduled; the
    /// returned snapshot carries its identifier.
    ///
    /// # Errors
    ///
    /// Returns `UnknownWorkflow`, `ShuttingDown`, `Validation` if the payload
    /// violates the workflow's input schema, or a store error. Nothing is
    /// stored on error.
    pub async fn submit(
        &self,
        request: Value,
        workflow: &str,
    ) -> Result<TaskInstance, OrchestratorError> {
        let bound = self
            .inner
            .workflows
            .get(workflow)
            .map(|w| Arc::clone(w.value()))
            .ok_or_else(|| OrchestratorError::UnknownWorkflow(workflow.to_string()))?;
        if self.inner.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }
        bound.definition.input_schema().validate(&request)?;

        let task = TaskInstance::new(request, workflow, bound.definition.stage_count());
        let task_id = task.id;
        self.inner.store.create_task(task.clone()).await?;
        self.inner.bus.open(task_id);
        self.inner
            .definitions
            .insert(task_id, Arc::clone(&bound.definition));
        self.inner
            .runtimes
            .insert(task_id, Arc::new(TaskRuntime::new(task_id, bound)));
        info!(task_id = %task_id, workflow = %workflow, "Task submitted");

        self.inner.spawn_evaluate(task_id);
        Ok(task)
    }

    /// Validates a typed research request and submits it.
    ///
    /// # Errors
    ///
    /// As [`Orchestrator::submit`], plus `Validation` for a blank query or
    /// an out-of-range document limit.
    pub async fn submit_research(
        &self,
        request: ResearchRequest,
        workflow: &str,
    ) -> Result<TaskInstance, OrchestratorError> {
        request.validate()?;
        let payload = request.to_payload()?;
        self.submit(payload, workflow).await
    }

    /// Requests cancellation of a task.
    ///
    /// Idempotent: a terminal task is returned unchanged. Stages already
    /// running observe the cancellation token; the task becomes Cancelled
    /// once none is in flight.
    ///
    /// # Errors
    ///
    /// Returns a store error if the task is unknown.
    pub async fn cancel(&self, task_id: TaskId) -> Result<TaskStatus, OrchestratorError> {
        let task = self.inner.store.read_task(task_id).await?;
        if task.is_terminal() {
            return Ok(task.status);
        }
        if let Some(rt) = self.inner.runtime(task_id) {
            rt.cancel.cancel("cancelled by caller");
            self.inner.evaluate(task_id).await?;
        }
        Ok(self.inner.store.read_task(task_id).await?.status)
    }

    /// Reads the current snapshot of a task.
    ///
    /// # Errors
    ///
    /// Returns a store error if the task is unknown.
    pub async fn task(&self, task_id: TaskId) -> Result<TaskInstance, OrchestratorError> {
        Ok(self.inner.store.read_task(task_id).await?)
    }

    /// Lists tasks, optionally filtered by status.
    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<TaskInstance> {
        self.inner.store.list_tasks(status).await
    }

    /// Streams a task's events, replaying from the start or after
    /// `after_sequence`.
    ///
    /// # Errors
    ///
    /// Returns a store error if the task is unknown or has been purged.
    pub async fn subscribe(
        &self,
        task_id: TaskId,
        after_sequence: Option<u64>,
    ) -> Result<EventStream, OrchestratorError> {
        self.inner.store.read_task(task_id).await?;
        Ok(self.inner.bus.subscribe(task_id, after_sequence))
    }

    /// Waits until the task reaches a terminal status and returns it.
    ///
    /// # Errors
    ///
    /// Returns a store error if the task is unknown.
    pub async fn wait_for_terminal(&self, task_id: TaskId) -> Result<TaskInstance, OrchestratorError> {
        let task = self.inner.store.read_task(task_id).await?;
        if task.is_terminal() {
            return Ok(task);
        }
        let mut events = self.inner.bus.subscribe(task_id, None);
        while let Some(event) = events.next().await {
            if event.is_terminal() {
                break;
            }
        }
        Ok(self.inner.store.read_task(task_id).await?)
    }

    /// Returns the result of a terminal task.
    ///
    /// # Errors
    ///
    /// The result is built against the definition the task was submitted
    /// under, even if its workflow has been re-registered since.
    ///
    /// # Errors
    ///
    /// Returns `NotTerminal` while the task is running, `UnknownWorkflow` if
    /// the task was submitted elsewhere and its workflow is not registered
    /// here, or a store error.
    pub async fn build_result(&self, task_id: TaskId) -> Result<Arc<ResearchResult>, OrchestratorError> {
        let task = self.inner.store.read_task(task_id).await?;
        let definition = self
            .inner
            .definitions
            .get(&task_id)
            .map(|d| Arc::clone(d.value()))
            .or_else(|| self.workflow(&task.workflow))
            .ok_or_else(|| OrchestratorError::UnknownWorkflow(task.workflow.clone()))?;
        self.inner.results.build_result(task_id, &definition).await
    }

    /// Removes terminal tasks completed before `completed_before`, along with
    /// their event logs and cached results.
    pub async fn purge(&self, completed_before: DateTime<Utc>) -> usize {
        for task in self.inner.store.list_tasks(None).await {
            let expired = task.is_terminal() && task.completed_at.is_some_and(|at| at < completed_before);
            if expired {
                self.inner.bus.remove(task.id);
                self.inner.results.evict(task.id);
                self.inner.definitions.remove(&task.id);
            }
        }
        let removed = self.inner.store.purge(completed_before).await;
        debug!(removed, "Purged tasks");
        removed
    }

    /// Number of tasks still being driven.
    #[must_use]
    pub fn active_tasks(&self) -> usize {
        self.inner.runtimes.len()
    }

    /// Stops the worker pool and pending retry timers.
    ///
    /// New submissions are refused; tasks that are mid-flight stay in their
    /// persisted state.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel("orchestrator shutdown");
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker ended abnormally");
            }
        }
        info!(active_tasks = self.active_tasks(), "Orchestrator stopped");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.inner.shutdown.cancel("orchestrator dropped");
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("workflows", &self.inner.workflows.len())
            .field("active_tasks", &self.inner.runtimes.len())
            .field("workers", &self.workers.lock().len())
            .finish()
    }
}
