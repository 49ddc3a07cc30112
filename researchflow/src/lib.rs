//! # Researchflow
//!
//! A workflow orchestration engine for multi-agent research pipelines.
//!
//! Researchflow runs a research request through a graph of agent stages
//! (plan, collect, analyze, write, or any custom set) with support for:
//!
//! - **Validated workflows**: Stage graphs checked for cycles, dangling and
//!   duplicate stages before they are accepted
//! - **Retries and timeouts**: Per-stage policies with backoff and jitter
//! - **Partial success**: Optional stages may fail without failing the task
//! - **Cancellation**: Cooperative cancellation of in-flight agent calls
//! - **Progress events**: Ordered, resumable per-task event streams
//! - **Result aggregation**: Deterministic final results for terminal tasks
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use researchflow::prelude::*;
//!
//! let registry = CapabilityRegistry::new()
//!     .with(Arc::new(EchoCapability::new(CapabilityKind::Planner)))
//!     .with(Arc::new(EchoCapability::new(CapabilityKind::Collector)))
//!     .with(Arc::new(EchoCapability::new(CapabilityKind::Analyzer)))
//!     .with(Arc::new(EchoCapability::new(CapabilityKind::Writer)));
//!
//! let orchestrator = Orchestrator::new(
//!     OrchestratorConfig::default(),
//!     Arc::new(InMemoryTaskStore::new()),
//!     Arc::new(registry),
//! );
//! orchestrator.register_workflow(
//!     WorkflowBuilder::research("research", &RetryPolicy::new(), DEFAULT_STAGE_TIMEOUT).build()?,
//! )?;
//!
//! let task = orchestrator
//!     .submit_research(ResearchRequest::new("graph neural networks"), "research")
//!     .await?;
//! orchestrator.wait_for_terminal(task.id).await?;
//! let result = orchestrator.build_result(task.id).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod capability;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod orchestrator;
pub mod request;
pub mod result;
pub mod store;
pub mod testing;
pub mod workflow;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::capability::{
        Capability, CapabilityInput, CapabilityKind, CapabilityRegistry, FnCapability,
    };
    pub use crate::config::{ConfigError, LogFormat, OrchestratorConfig};
    pub use crate::core::{Event, EventKind, StageStatus, TaskId, TaskStatus};
    pub use crate::errors::{
        CapabilityError, ContractErrorInfo, GraphError, NotTerminalError, OrchestratorError,
        StoreError, TimeoutError, ValidationError,
    };
    pub use crate::events::{
        CollectingEventSink, EventBus, EventSink, EventStream, LoggingEventSink, NoOpEventSink,
    };
    pub use crate::observability::{init_tracing, SpanTimer};
    pub use crate::orchestrator::Orchestrator;
    pub use crate::request::{Language, ResearchDepth, ResearchRequest};
    pub use crate::result::{ResearchResult, StageErrorRecord};
    pub use crate::store::{InMemoryTaskStore, StageExecution, TaskInstance, TaskStore};
    pub use crate::testing::EchoCapability;
    pub use crate::workflow::{
        BackoffStrategy, Dependency, FailureMode, InputSchema, JitterStrategy, RetryPolicy,
        StageSpec, WorkflowBuilder, WorkflowDefinition, DEFAULT_STAGE_TIMEOUT,
    };
    pub use std::sync::Arc;
}
