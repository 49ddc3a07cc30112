//! Test fixtures for orchestrator testing.

use std::sync::Arc;
use std::time::Duration;

use crate::capability::{Capability, CapabilityRegistry};
use crate::config::{Environment, OrchestratorConfig};
use crate::orchestrator::Orchestrator;
use crate::store::InMemoryTaskStore;
use crate::workflow::{RetryPolicy, WorkflowBuilder};

/// Name under which [`research_workflow`] is built.
pub const RESEARCH_WORKFLOW: &str = "research";

/// Retry policy with millisecond backoff so tests stay fast.
#[must_use]
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new()
        .with_max_attempts(max_attempts)
        .with_base_delay_ms(5)
        .with_max_delay_ms(20)
}

/// The plan, collect, analyze, write pipeline with fast retries.
#[must_use]
pub fn research_workflow() -> WorkflowBuilder {
    WorkflowBuilder::research(RESEARCH_WORKFLOW, &fast_retry(3), Duration::from_secs(5))
}

/// Configuration used by tests.
#[must_use]
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        environment: Environment::Testing,
        ..OrchestratorConfig::default()
    }
}

/// Builds a registry from the given capabilities.
#[must_use]
pub fn registry_with(capabilities: impl IntoIterator<Item = Arc<dyn Capability>>) -> Arc<CapabilityRegistry> {
    let registry = CapabilityRegistry::new();
    for capability in capabilities {
        registry.register(capability);
    }
    Arc::new(registry)
}

/// An orchestrator over a fresh in-memory store.
///
/// Must be called inside a tokio runtime.
#[must_use]
pub fn test_orchestrator(
    capabilities: impl IntoIterator<Item = Arc<dyn Capability>>,
) -> (Orchestrator, Arc<InMemoryTaskStore>) {
    let store = Arc::new(InMemoryTaskStore::new());
    let orchestrator = Orchestrator::new(test_config(), store.clone(), registry_with(capabilities));
    (orchestrator, store)
}
