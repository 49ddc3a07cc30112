//! Agent capabilities.
//!
//! A capability is the uniform contract every agent (planner, collector,
//! analyzer, writer or a custom one) implements. The orchestrator only ever
//! sees this trait; what an agent does with its input is its own business.

mod adapters;
mod registry;

pub use adapters::FnCapability;
pub use registry::CapabilityRegistry;

use crate::cancellation::CancellationToken;
use crate::core::TaskId;
use crate::errors::CapabilityError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Debug};

/// The kind of agent a stage is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    /// Decomposes the research query into a plan.
    Planner,
    /// Gathers documents from literature sources.
    Collector,
    /// Analyses collected documents.
    Analyzer,
    /// Writes the report.
    Writer,
    /// Any other agent, identified by name.
    Custom(String),
}

impl CapabilityKind {
    /// Creates a custom capability kind.
    #[must_use]
    pub fn custom(name: impl Into<String>) -> Self {
        Self::Custom(name.into())
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Planner => write!(f, "planner"),
            Self::Collector => write!(f, "collector"),
            Self::Analyzer => write!(f, "analyzer"),
            Self::Writer => write!(f, "writer"),
            Self::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

/// Everything a capability receives for one stage attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityInput {
    /// The task being executed.
    pub task_id: TaskId,
    /// The stage being executed.
    pub stage_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// The original request payload.
    pub request: serde_json::Value,
    /// Outputs of the stage's succeeded upstream dependencies.
    #[serde(default)]
    pub upstream: BTreeMap<String, serde_json::Value>,
}

impl CapabilityInput {
    /// Returns the output of an upstream stage, if it succeeded.
    #[must_use]
    pub fn upstream_output(&self, stage: &str) -> Option<&serde_json::Value> {
        self.upstream.get(stage)
    }

    /// Returns a string field of the request payload.
    #[must_use]
    pub fn request_str(&self, field: &str) -> Option<&str> {
        self.request.get(field).and_then(serde_json::Value::as_str)
    }
}

/// Trait for agent capabilities.
///
/// Implementations should observe `cancel` cooperatively. Each call runs on
/// its own tokio task: a call that outlives its stage timeout is aborted and
/// a panic fails the attempt like any other error.
#[async_trait]
pub trait Capability: Send + Sync + Debug {
    /// Returns the kind this capability implements.
    fn kind(&self) -> CapabilityKind;

    /// Runs one attempt of a stage.
    async fn invoke(
        &self,
        input: CapabilityInput,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, CapabilityError>;
}
