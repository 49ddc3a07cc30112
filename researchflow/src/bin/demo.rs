//! researchflow-demo - runs the standard research workflow with echo agents.
//!
//! Usage: `researchflow-demo [QUERY]`. Settings come from `RESEARCHFLOW_*`
//! environment variables.

use futures::StreamExt;
use researchflow::prelude::*;
use std::time::Duration;
use tracing::info;

const WORKFLOW: &str = "research";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OrchestratorConfig::from_env()?;
    init_tracing(&config.log_level, config.log_format)?;
    info!(environment = ?config.environment, workers = config.max_concurrent_stages, "Loaded configuration");

    let query = std::env::args()
        .skip(1)
        .collect::<Vec<_>>()
        .join(" ");
    let query = if query.trim().is_empty() {
        "large language models for literature review".to_string()
    } else {
        query
    };

    let registry = CapabilityRegistry::new()
        .with(Arc::new(EchoCapability::new(CapabilityKind::Planner).with_delay(Duration::from_millis(50))))
        .with(Arc::new(EchoCapability::new(CapabilityKind::Collector).with_delay(Duration::from_millis(150))))
        .with(Arc::new(EchoCapability::new(CapabilityKind::Analyzer).with_delay(Duration::from_millis(100))))
        .with(Arc::new(EchoCapability::new(CapabilityKind::Writer).with_delay(Duration::from_millis(80))));

    let orchestrator = Orchestrator::new(
        config.clone(),
        Arc::new(InMemoryTaskStore::new()),
        Arc::new(registry),
    );
    orchestrator.bus().add_sink(Arc::new(LoggingEventSink::debug()));

    let retry = RetryPolicy::new().with_max_attempts(config.default_max_attempts);
    orchestrator.register_workflow(
        WorkflowBuilder::research(WORKFLOW, &retry, config.default_stage_timeout()).build()?,
    )?;

    let task = orchestrator
        .submit_research(ResearchRequest::new(query), WORKFLOW)
        .await?;
    info!(task_id = %task.id, "Submitted research task");

    let mut events = orchestrator.subscribe(task.id, None).await?;
    while let Some(event) = events.next().await {
        info!(
            sequence = event.sequence,
            kind = %event.kind,
            stage = event.stage_id.as_deref().unwrap_or("-"),
            "Progress"
        );
    }

    let result = orchestrator.build_result(task.id).await?;
    println!("{}", serde_json::to_string_pretty(result.as_ref())?);

    orchestrator.shutdown().await;
    Ok(())
}
