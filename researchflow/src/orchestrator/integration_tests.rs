//! End-to-end tests driving tasks through the orchestrator.

#[cfg(test)]
mod tests {
    use crate::cancellation::CancellationToken;
    use crate::capability::{Capability, CapabilityInput, CapabilityKind};
    use crate::core::{EventKind, StageStatus, TaskId, TaskStatus};
    use crate::errors::{CapabilityError, OrchestratorError, StoreError};
    use crate::events::CollectingEventSink;
    use crate::orchestrator::Orchestrator;
    use crate::request::ResearchRequest;
    use crate::store::{InMemoryTaskStore, StageExecution, TaskInstance, TaskStore};
    use crate::testing::{
        fast_retry, registry_with, research_workflow, test_config, test_orchestrator,
        BlockingCapability, EchoCapability, ScriptedCapability, SlowCapability, RESEARCH_WORKFLOW,
    };
    use crate::workflow::{FailureMode, StageSpec, WorkflowBuilder, WorkflowDefinition};
    use async_trait::async_trait;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(10);

    fn echo(kind: CapabilityKind) -> Arc<dyn Capability> {
        Arc::new(EchoCapability::new(kind))
    }

    fn echo_agents() -> Vec<Arc<dyn Capability>> {
        vec![
            echo(CapabilityKind::Planner),
            echo(CapabilityKind::Collector),
            echo(CapabilityKind::Analyzer),
            echo(CapabilityKind::Writer),
        ]
    }

    /// Echo agents with `replacement` standing in for its kind.
    fn agents_with(replacement: Arc<dyn Capability>) -> Vec<Arc<dyn Capability>> {
        let kind = replacement.kind();
        let mut agents: Vec<_> = echo_agents().into_iter().filter(|a| a.kind() != kind).collect();
        agents.push(replacement);
        agents
    }

    fn request() -> Value {
        json!({"query": "retrieval augmented generation"})
    }

    async fn run_to_end(orchestrator: &Orchestrator, task: &TaskInstance) -> TaskInstance {
        tokio::time::timeout(WAIT, orchestrator.wait_for_terminal(task.id))
            .await
            .expect("task did not finish in time")
            .unwrap()
    }

    #[tokio::test]
    async fn test_linear_workflow_completes() {
        let analyzer = Arc::new(ScriptedCapability::new(CapabilityKind::Analyzer));
        let (orchestrator, _store) = test_orchestrator(agents_with(analyzer.clone()));
        orchestrator.register_workflow(research_workflow().build().unwrap()).unwrap();

        let submitted = orchestrator.submit(request(), RESEARCH_WORKFLOW).await.unwrap();
        assert_eq!(submitted.status, TaskStatus::Pending);

        let task = run_to_end(&orchestrator, &submitted).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert!(task.completed_at.is_some());
        for stage in ["plan", "collect", "analyze", "write"] {
            assert_eq!(task.stage_status(stage), StageStatus::Succeeded, "{stage}");
        }

        let inputs = analyzer.recorded_inputs();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].attempt, 1);
        assert!(inputs[0].upstream_output("collect").is_some());
        assert!(inputs[0].upstream_output("plan").is_none());

        let result = orchestrator.build_result(task.id).await.unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.outputs.len(), 4);
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn test_stages_start_in_dependency_order() {
        let (orchestrator, _store) = test_orchestrator(echo_agents());
        orchestrator.register_workflow(research_workflow().build().unwrap()).unwrap();

        let task = orchestrator.submit(request(), RESEARCH_WORKFLOW).await.unwrap();
        run_to_end(&orchestrator, &task).await;

        let started: Vec<String> = orchestrator
            .bus()
            .events(task.id)
            .into_iter()
            .filter(|e| e.kind == EventKind::StageStarted)
            .filter_map(|e| e.stage_id)
            .collect();
        assert_eq!(started, vec!["plan", "collect", "analyze", "write"]);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let collector = Arc::new(
            ScriptedCapability::new(CapabilityKind::Collector)
                .then_err(CapabilityError::retryable("source unavailable"))
                .then_err(CapabilityError::retryable("source unavailable")),
        );
        let analyzer = Arc::new(ScriptedCapability::new(CapabilityKind::Analyzer));
        let (orchestrator, _store) = test_orchestrator(vec![
            echo(CapabilityKind::Planner),
            collector.clone() as Arc<dyn Capability>,
            analyzer.clone(),
            echo(CapabilityKind::Writer),
        ]);
        orchestrator.register_workflow(research_workflow().build().unwrap()).unwrap();

        let task = orchestrator.submit(request(), RESEARCH_WORKFLOW).await.unwrap();
        let task = run_to_end(&orchestrator, &task).await;

        assert_eq!(task.status, TaskStatus::Completed);
        let collect = task.stage("collect").unwrap();
        assert_eq!(collect.status, StageStatus::Succeeded);
        assert_eq!(collect.attempts, 3);
        assert!(collect.last_error.is_none());
        assert_eq!(collector.call_count(), 3);
        let attempts: Vec<u32> = collector.recorded_inputs().iter().map(|i| i.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);

        assert_eq!(analyzer.call_count(), 1);
        assert!(analyzer.recorded_inputs()[0].upstream_output("collect").is_some());
        assert_eq!(task.stage_status("write"), StageStatus::Succeeded);

        let events = orchestrator.bus().events(task.id);
        let kinds: Vec<EventKind> = events
            .iter()
            .filter(|e| e.stage_id.as_deref() == Some("collect"))
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::StageStarted,
                EventKind::StageFailed,
                EventKind::StageRetrying,
                EventKind::StageStarted,
                EventKind::StageFailed,
                EventKind::StageRetrying,
                EventKind::StageStarted,
                EventKind::StageSucceeded,
            ]
        );
        let failed = events.iter().find(|e| e.kind == EventKind::StageFailed).unwrap();
        assert_eq!(failed.payload["will_retry"], json!(true));
    }

    #[tokio::test]
    async fn test_retryable_failure_uses_every_attempt() {
        let collector = Arc::new(ScriptedCapability::failing(
            CapabilityKind::Collector,
            CapabilityError::retryable("rate limited"),
        ));
        let (orchestrator, _store) = test_orchestrator(agents_with(collector.clone()));
        orchestrator.register_workflow(research_workflow().build().unwrap()).unwrap();

        let task = orchestrator.submit(request(), RESEARCH_WORKFLOW).await.unwrap();
        let task = run_to_end(&orchestrator, &task).await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(collector.call_count(), 3);
        let collect = task.stage("collect").unwrap();
        assert_eq!(collect.attempts, 3);
        assert_eq!(collect.status, StageStatus::Failed);
        assert!(collect.retry_at.is_none());
    }

    /// Plan, collect, analyze, write; write depends on analyze with no
    /// explicit edge flag.
    fn tolerant_workflow(analyze_required: bool) -> WorkflowDefinition {
        let analyze = StageSpec::new("analyze", CapabilityKind::Analyzer)
            .depends_on("collect")
            .with_max_attempts(1);
        WorkflowBuilder::new("tolerant")
            .stage(StageSpec::new("plan", CapabilityKind::Planner))
            .stage(StageSpec::new("collect", CapabilityKind::Collector).depends_on("plan"))
            .stage(if analyze_required { analyze } else { analyze.optional() })
            .stage(
                StageSpec::new("write", CapabilityKind::Writer)
                    .depends_on("collect")
                    .depends_on("analyze"),
            )
            .build()
            .unwrap()
    }

    fn refusing_analyzer() -> Arc<ScriptedCapability> {
        Arc::new(ScriptedCapability::failing(
            CapabilityKind::Analyzer,
            CapabilityError::permanent("model refused"),
        ))
    }

    #[tokio::test]
    async fn test_optional_stage_failure_still_completes() {
        let writer = Arc::new(ScriptedCapability::new(CapabilityKind::Writer));
        let (orchestrator, _store) = test_orchestrator(vec![
            echo(CapabilityKind::Planner),
            echo(CapabilityKind::Collector),
            refusing_analyzer() as Arc<dyn Capability>,
            writer.clone(),
        ]);
        orchestrator.register_workflow(tolerant_workflow(false)).unwrap();

        let task = orchestrator.submit(request(), "tolerant").await.unwrap();
        let task = run_to_end(&orchestrator, &task).await;

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.stage_status("analyze"), StageStatus::Failed);
        assert_eq!(task.stage_status("write"), StageStatus::Succeeded);
        let upstream = &writer.recorded_inputs()[0].upstream;
        assert!(upstream.contains_key("collect"));
        assert!(!upstream.contains_key("analyze"));

        let result = orchestrator.build_result(task.id).await.unwrap();
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].stage_id, "analyze");
        assert_eq!(result.errors[0].error.as_deref(), Some("model refused"));
        assert!(!result.errors[0].required);
    }

    #[tokio::test]
    async fn test_result_keeps_definition_task_ran_under() {
        let (orchestrator, _store) = test_orchestrator(agents_with(refusing_analyzer()));
        orchestrator.register_workflow(tolerant_workflow(false)).unwrap();

        let before = orchestrator.submit(request(), "tolerant").await.unwrap();
        let before = run_to_end(&orchestrator, &before).await;
        assert_eq!(before.status, TaskStatus::Completed);

        orchestrator.register_workflow(tolerant_workflow(true)).unwrap();

        let result = orchestrator.build_result(before.id).await.unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.errors.len(), 1);
        assert!(!result.errors[0].required);
        assert_eq!(result.required_errors().count(), 0);

        let after = orchestrator.submit(request(), "tolerant").await.unwrap();
        let after = run_to_end(&orchestrator, &after).await;
        assert_eq!(after.status, TaskStatus::Failed);
        assert_eq!(after.stage_status("write"), StageStatus::Skipped);
    }

    #[tokio::test]
    async fn test_required_failure_skips_downstream() {
        let collector = Arc::new(ScriptedCapability::failing(
            CapabilityKind::Collector,
            CapabilityError::permanent("invalid query"),
        ));
        let (orchestrator, _store) = test_orchestrator(agents_with(collector.clone()));
        orchestrator.register_workflow(research_workflow().build().unwrap()).unwrap();

        let task = orchestrator.submit(request(), RESEARCH_WORKFLOW).await.unwrap();
        let task = run_to_end(&orchestrator, &task).await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(collector.call_count(), 1);
        assert_eq!(task.stage_status("plan"), StageStatus::Succeeded);
        assert_eq!(task.stage_status("collect"), StageStatus::Failed);
        assert_eq!(task.stage_status("analyze"), StageStatus::Skipped);
        assert_eq!(task.stage_status("write"), StageStatus::Skipped);
        let message = task.error_message.clone().unwrap();
        assert!(message.contains("collect"), "{message}");
        assert!(message.contains("invalid query"), "{message}");

        let result = orchestrator.build_result(task.id).await.unwrap();
        assert_eq!(result.outputs.keys().collect::<Vec<_>>(), vec!["plan"]);
        assert_eq!(result.required_errors().count(), 3);
    }

    #[tokio::test]
    async fn test_fail_fast_skips_unrelated_branch() {
        let build = |mode: FailureMode| {
            WorkflowBuilder::new(format!("branches-{}", mode == FailureMode::FailFast))
                .stage(StageSpec::new("broken", CapabilityKind::custom("broken")).with_max_attempts(1))
                .stage(StageSpec::new("slow", CapabilityKind::Collector))
                .stage(StageSpec::new("after", CapabilityKind::Writer).depends_on("slow"))
                .with_failure_mode(mode)
                .build()
                .unwrap()
        };
        let agents: Vec<Arc<dyn Capability>> = vec![
            Arc::new(ScriptedCapability::failing(
                CapabilityKind::custom("broken"),
                CapabilityError::permanent("boom"),
            )),
            Arc::new(EchoCapability::new(CapabilityKind::Collector).with_delay(Duration::from_millis(50))),
            echo(CapabilityKind::Writer),
        ];
        let (orchestrator, _store) = test_orchestrator(agents);
        let fail_fast = build(FailureMode::FailFast);
        let tolerant = build(FailureMode::ContinueOnFailure);
        let (fail_fast_name, tolerant_name) = (fail_fast.name().to_string(), tolerant.name().to_string());
        orchestrator.register_workflow(fail_fast).unwrap();
        orchestrator.register_workflow(tolerant).unwrap();

        let task = orchestrator.submit(json!({}), &fail_fast_name).await.unwrap();
        let task = run_to_end(&orchestrator, &task).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.stage_status("after"), StageStatus::Skipped);

        let task = orchestrator.submit(json!({}), &tolerant_name).await.unwrap();
        let task = run_to_end(&orchestrator, &task).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.stage_status("after"), StageStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_cancel_while_stage_running() {
        let collector = Arc::new(BlockingCapability::new(CapabilityKind::Collector));
        let analyzer = Arc::new(ScriptedCapability::new(CapabilityKind::Analyzer));
        let (orchestrator, _store) = test_orchestrator(vec![
            echo(CapabilityKind::Planner),
            collector.clone() as Arc<dyn Capability>,
            analyzer.clone(),
            echo(CapabilityKind::Writer),
        ]);
        orchestrator.register_workflow(research_workflow().build().unwrap()).unwrap();

        let task = orchestrator.submit(request(), RESEARCH_WORKFLOW).await.unwrap();
        tokio::time::timeout(WAIT, collector.wait_started()).await.unwrap();

        let status = orchestrator.cancel(task.id).await.unwrap();
        assert!(matches!(status, TaskStatus::Cancelling | TaskStatus::Cancelled));

        let task = run_to_end(&orchestrator, &task).await;
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.stage_status("plan"), StageStatus::Succeeded);
        assert_eq!(task.stage_status("collect"), StageStatus::Failed);
        assert!(task.stage_status("analyze").is_unstarted());
        assert_eq!(analyzer.call_count(), 0);

        let kinds: Vec<EventKind> = orchestrator
            .bus()
            .events(task.id)
            .into_iter()
            .filter(|e| e.stage_id.is_none())
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![EventKind::TaskStarted, EventKind::TaskCancelling, EventKind::TaskCancelled]
        );

        // Idempotent once terminal.
        assert_eq!(orchestrator.cancel(task.id).await.unwrap(), TaskStatus::Cancelled);
        let result = orchestrator.build_result(task.id).await.unwrap();
        assert!(result.outputs.contains_key("plan"));
    }

    #[tokio::test]
    async fn test_stage_timeout_is_retried_then_fails() {
        let definition = WorkflowBuilder::new("sluggish")
            .stage(
                StageSpec::new("collect", CapabilityKind::Collector)
                    .with_retry(fast_retry(2))
                    .with_timeout(Duration::from_millis(20)),
            )
            .build()
            .unwrap();
        let collector = Arc::new(SlowCapability::new(CapabilityKind::Collector, Duration::from_millis(500)));
        let (orchestrator, _store) = test_orchestrator(vec![collector.clone() as Arc<dyn Capability>]);
        orchestrator.register_workflow(definition).unwrap();

        let task = orchestrator.submit(json!({}), "sluggish").await.unwrap();
        let task = run_to_end(&orchestrator, &task).await;

        assert_eq!(task.status, TaskStatus::Failed);
        let collect = task.stage("collect").unwrap();
        assert_eq!(collect.attempts, 2);
        assert!(collect.output.is_none());
        assert!(collect.last_error.as_deref().unwrap().contains("timed out"));
        assert_eq!(collector.call_count(), 2);
    }

    #[derive(Debug)]
    struct PanickingCapability;

    #[async_trait]
    impl Capability for PanickingCapability {
        fn kind(&self) -> CapabilityKind {
            CapabilityKind::Collector
        }

        async fn invoke(
            &self,
            _input: CapabilityInput,
            _cancel: CancellationToken,
        ) -> Result<Value, CapabilityError> {
            panic!("collector crashed")
        }
    }

    #[tokio::test]
    async fn test_panicking_capability_fails_stage_and_keeps_worker() {
        let config = test_config().with_max_concurrent_stages(1);
        let orchestrator = Orchestrator::new(
            config,
            Arc::new(InMemoryTaskStore::new()),
            registry_with([
                Arc::new(PanickingCapability) as Arc<dyn Capability>,
                echo(CapabilityKind::Writer),
            ]),
        );
        orchestrator
            .register_workflow(
                WorkflowBuilder::new("crashing")
                    .stage(StageSpec::new("collect", CapabilityKind::Collector).with_retry(fast_retry(2)))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        orchestrator
            .register_workflow(
                WorkflowBuilder::new("healthy")
                    .stage(StageSpec::new("write", CapabilityKind::Writer))
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let task = orchestrator.submit(json!({}), "crashing").await.unwrap();
        let task = run_to_end(&orchestrator, &task).await;
        assert_eq!(task.status, TaskStatus::Failed);
        let collect = task.stage("collect").unwrap();
        assert_eq!(collect.status, StageStatus::Failed);
        assert_eq!(collect.attempts, 2);
        assert!(collect.last_error.as_deref().unwrap().contains("panicked"));

        // The single worker survived both panics.
        let task = orchestrator.submit(json!({}), "healthy").await.unwrap();
        let task = run_to_end(&orchestrator, &task).await;
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[derive(Debug, Default)]
    struct ConcurrencyGauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Capability for ConcurrencyGauge {
        fn kind(&self) -> CapabilityKind {
            CapabilityKind::custom("gauge")
        }

        async fn invoke(
            &self,
            input: CapabilityInput,
            _cancel: CancellationToken,
        ) -> Result<Value, CapabilityError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(json!(input.stage_id))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_per_task_concurrency_limit() {
        let gauge = Arc::new(ConcurrencyGauge::default());
        let store = Arc::new(InMemoryTaskStore::new());
        let config = test_config()
            .with_max_concurrent_stages(8)
            .with_max_concurrent_stages_per_task(2);
        let orchestrator = Orchestrator::new(config, store, registry_with([gauge.clone() as Arc<dyn Capability>]));

        let definition = WorkflowBuilder::new("fan_out")
            .stages((0..6).map(|i| StageSpec::new(format!("leaf_{i}"), CapabilityKind::custom("gauge"))))
            .build()
            .unwrap();
        orchestrator.register_workflow(definition).unwrap();

        let task = orchestrator.submit(json!({}), "fan_out").await.unwrap();
        let task = run_to_end(&orchestrator, &task).await;

        assert_eq!(task.status, TaskStatus::Completed);
        let peak = gauge.peak.load(Ordering::SeqCst);
        assert!(peak <= 2, "peak concurrency {peak}");
        assert!(peak >= 1);
    }

    /// Delegates to an in-memory store but never reports `held` as ready.
    #[derive(Debug)]
    struct GatedStore {
        inner: InMemoryTaskStore,
        held: &'static str,
    }

    #[async_trait]
    impl TaskStore for GatedStore {
        async fn create_task(&self, task: TaskInstance) -> Result<(), StoreError> {
            self.inner.create_task(task).await
        }

        async fn read_task(&self, task_id: TaskId) -> Result<TaskInstance, StoreError> {
            self.inner.read_task(task_id).await
        }

        async fn update_stage_execution(
            &self,
            task_id: TaskId,
            execution: StageExecution,
            expected_version: u64,
        ) -> Result<u64, StoreError> {
            self.inner
                .update_stage_execution(task_id, execution, expected_version)
                .await
        }

        async fn update_task(&self, task: &TaskInstance, expected_version: u64) -> Result<u64, StoreError> {
            self.inner.update_task(task, expected_version).await
        }

        async fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<TaskInstance> {
            self.inner.list_tasks(status).await
        }

        async fn purge(&self, completed_before: chrono::DateTime<chrono::Utc>) -> usize {
            self.inner.purge(completed_before).await
        }

        async fn list_ready_candidates(
            &self,
            task_id: TaskId,
            definition: &WorkflowDefinition,
        ) -> Result<Vec<String>, StoreError> {
            let mut ready = self.inner.list_ready_candidates(task_id, definition).await?;
            ready.retain(|id| id != self.held);
            Ok(ready)
        }
    }

    #[tokio::test]
    async fn test_dispatch_follows_store_ready_candidates() {
        let critic = Arc::new(ScriptedCapability::new(CapabilityKind::custom("critic")));
        let store = Arc::new(GatedStore {
            inner: InMemoryTaskStore::new(),
            held: "critique",
        });
        let orchestrator = Orchestrator::new(
            test_config(),
            store,
            registry_with([echo(CapabilityKind::Planner), critic.clone() as Arc<dyn Capability>]),
        );
        orchestrator
            .register_workflow(
                WorkflowBuilder::new("gated")
                    .stage(StageSpec::new("plan", CapabilityKind::Planner))
                    .stage(StageSpec::new("critique", CapabilityKind::custom("critic")))
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let task = orchestrator.submit(json!({}), "gated").await.unwrap();
        let mut events = orchestrator.subscribe(task.id, None).await.unwrap();
        tokio::time::timeout(WAIT, async {
            while let Some(event) = events.next().await {
                if event.kind == EventKind::StageSucceeded && event.stage_id.as_deref() == Some("plan") {
                    break;
                }
            }
        })
        .await
        .unwrap();

        let snapshot = orchestrator.task(task.id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Running);
        assert_eq!(snapshot.stage_status("critique"), StageStatus::Ready);
        assert_eq!(critic.call_count(), 0);

        orchestrator.cancel(task.id).await.unwrap();
        let task = run_to_end(&orchestrator, &task).await;
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(critic.call_count(), 0);
    }

    #[tokio::test]
    async fn test_event_log_is_gap_free_and_resumable() {
        let sink = Arc::new(CollectingEventSink::new());
        let (orchestrator, _store) = test_orchestrator(echo_agents());
        orchestrator.bus().add_sink(sink.clone());
        orchestrator.register_workflow(research_workflow().build().unwrap()).unwrap();

        let task = orchestrator.submit(request(), RESEARCH_WORKFLOW).await.unwrap();
        let stream = orchestrator.subscribe(task.id, None).await.unwrap();
        let live: Vec<_> = tokio::time::timeout(WAIT, stream.collect::<Vec<_>>())
            .await
            .unwrap();

        let sequences: Vec<u64> = live.iter().map(|e| e.sequence).collect();
        let expected: Vec<u64> = (1..=live.len() as u64).collect();
        assert_eq!(sequences, expected);
        assert_eq!(live.first().unwrap().kind, EventKind::TaskStarted);
        assert_eq!(live.last().unwrap().kind, EventKind::TaskCompleted);
        assert_eq!(sink.len(), live.len());

        let resumed: Vec<_> = orchestrator
            .subscribe(task.id, Some(3))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(resumed.first().unwrap().sequence, 4);
        assert_eq!(resumed.len(), live.len() - 3);
        assert_eq!(resumed.last(), live.last());
    }

    #[tokio::test]
    async fn test_build_result_is_idempotent() {
        let (orchestrator, _store) = test_orchestrator(echo_agents());
        orchestrator.register_workflow(research_workflow().build().unwrap()).unwrap();

        let task = orchestrator.submit(request(), RESEARCH_WORKFLOW).await.unwrap();
        run_to_end(&orchestrator, &task).await;

        let first = orchestrator.build_result(task.id).await.unwrap();
        let second = orchestrator.build_result(task.id).await.unwrap();
        assert_eq!(first.to_json_bytes(), second.to_json_bytes());
        assert_eq!(first.digest(), second.digest());
    }

    #[tokio::test]
    async fn test_build_result_before_terminal() {
        let collector = Arc::new(BlockingCapability::new(CapabilityKind::Collector));
        let (orchestrator, _store) = test_orchestrator(agents_with(collector.clone()));
        orchestrator.register_workflow(research_workflow().build().unwrap()).unwrap();

        let task = orchestrator.submit(request(), RESEARCH_WORKFLOW).await.unwrap();
        tokio::time::timeout(WAIT, collector.wait_started()).await.unwrap();

        let err = orchestrator.build_result(task.id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotTerminal(_)));

        orchestrator.cancel(task.id).await.unwrap();
        run_to_end(&orchestrator, &task).await;
    }

    #[tokio::test]
    async fn test_submit_rejections_store_nothing() {
        let (orchestrator, store) = test_orchestrator(echo_agents());
        orchestrator.register_workflow(research_workflow().build().unwrap()).unwrap();

        let err = orchestrator.submit(request(), "missing").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownWorkflow(name) if name == "missing"));

        let err = orchestrator
            .submit(json!({"depth": "deep"}), RESEARCH_WORKFLOW)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));

        let err = orchestrator
            .submit_research(ResearchRequest::new("q").with_max_documents(0), RESEARCH_WORKFLOW)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));

        assert!(store.is_empty());
        assert!(store.list_tasks(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_submit_research_round_trips_request() {
        let (orchestrator, _store) = test_orchestrator(echo_agents());
        orchestrator.register_workflow(research_workflow().build().unwrap()).unwrap();

        let task = orchestrator
            .submit_research(ResearchRequest::new("protein folding"), RESEARCH_WORKFLOW)
            .await
            .unwrap();
        assert_eq!(task.request["language"], json!("zh"));

        let task = run_to_end(&orchestrator, &task).await;
        let result = orchestrator.build_result(task.id).await.unwrap();
        assert_eq!(result.outputs["write"]["query"], json!("protein folding"));
    }

    #[tokio::test]
    async fn test_register_workflow_requires_capabilities() {
        let (orchestrator, _store) = test_orchestrator(vec![echo(CapabilityKind::Planner)]);
        let err = orchestrator
            .register_workflow(research_workflow().build().unwrap())
            .unwrap_err();
        assert_eq!(err.code(), Some("WORKFLOW-CAPABILITY"));
        assert!(orchestrator.workflow(RESEARCH_WORKFLOW).is_none());
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_tasks() {
        let (orchestrator, _store) = test_orchestrator(echo_agents());
        orchestrator.register_workflow(research_workflow().build().unwrap()).unwrap();
        orchestrator.shutdown().await;

        let err = orchestrator.submit(request(), RESEARCH_WORKFLOW).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_subscribe_to_unknown_task_is_an_error() {
        let (orchestrator, _store) = test_orchestrator(echo_agents());

        let err = orchestrator.subscribe(TaskId::new(), None).await.err().unwrap();
        assert!(matches!(err, OrchestratorError::Store(_)));
        assert_eq!(format!("{:?}", orchestrator.bus()), "EventBus { tasks: 0, sinks: 0 }");
    }

    #[tokio::test]
    async fn test_purge_drops_finished_tasks() {
        let (orchestrator, store) = test_orchestrator(echo_agents());
        orchestrator.register_workflow(research_workflow().build().unwrap()).unwrap();

        let task = orchestrator.submit(request(), RESEARCH_WORKFLOW).await.unwrap();
        run_to_end(&orchestrator, &task).await;

        let removed = orchestrator.purge(chrono::Utc::now() + chrono::Duration::seconds(1)).await;
        assert_eq!(removed, 1);
        assert!(store.read_task(task.id).await.is_err());
        assert!(orchestrator.bus().events(task.id).is_empty());

        let err = orchestrator.subscribe(task.id, None).await.err().unwrap();
        assert!(matches!(err, OrchestratorError::Store(_)));
        assert!(orchestrator.bus().events(task.id).is_empty());
        assert!(orchestrator.build_result(task.id).await.is_err());
    }
}
