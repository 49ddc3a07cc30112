//! Error types for the researchflow orchestrator.
//!
//! The taxonomy separates load-time failures (`GraphError`), submission-time
//! failures (`ValidationError`), failures absorbed by the stage state machine
//! (`CapabilityError`, `TimeoutError`) and retrieval failures
//! (`NotTerminalError`). `OrchestratorError` wraps everything a public
//! orchestrator call can return.

use crate::core::{StageStatus, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// The main error type for orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The workflow definition is malformed.
    #[error("{0}")]
    Graph(#[from] GraphError),

    /// The request payload does not match the workflow's input shape.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// A result was requested before the task finished.
    #[error("{0}")]
    NotTerminal(#[from] NotTerminalError),

    /// The task store rejected an operation.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// A stage transition outside the state machine was attempted.
    #[error("{0}")]
    InvalidTransition(#[from] TransitionError),

    /// No workflow is registered under the given name.
    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// The orchestrator has been shut down.
    #[error("Orchestrator is shutting down")]
    ShuttingDown,

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Metadata about a definition error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "WORKFLOW-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when a workflow definition is malformed.
///
/// Only ever produced while a definition is built or registered, never while
/// a task runs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct GraphError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl GraphError {
    /// Creates a new graph error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the error code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }

    /// The dependency graph contains a cycle.
    #[must_use]
    pub fn cycle(cycle_path: Vec<String>) -> Self {
        let path = cycle_path.join(" -> ");
        Self::new(format!("Cycle detected in workflow: {path}"))
            .with_stages(cycle_path)
            .with_error_info(
                ContractErrorInfo::new(
                    "WORKFLOW-CYCLE",
                    format!("Workflow contains a dependency cycle: {path}"),
                )
                .with_fix_hint("Remove one of the dependencies in the cycle to break it."),
            )
    }

    /// A stage depends on a stage that does not exist.
    #[must_use]
    pub fn missing_dependency(stage: &str, dependency: &str) -> Self {
        Self::new(format!(
            "Stage '{stage}' depends on unknown stage '{dependency}'"
        ))
        .with_stages(vec![stage.to_string(), dependency.to_string()])
        .with_error_info(
            ContractErrorInfo::new(
                "WORKFLOW-MISSING-DEP",
                format!("Dependency '{dependency}' not found"),
            )
            .with_fix_hint("Check for typos in stage identifiers."),
        )
    }

    /// Two stages share an identifier.
    #[must_use]
    pub fn duplicate_stage(stage: &str) -> Self {
        Self::new(format!("Duplicate stage identifier '{stage}'"))
            .with_stages(vec![stage.to_string()])
            .with_error_info(ContractErrorInfo::new(
                "WORKFLOW-DUPLICATE",
                format!("Stage '{stage}' is declared more than once"),
            ))
    }

    /// A stage lists itself as a dependency.
    #[must_use]
    pub fn self_dependency(stage: &str) -> Self {
        Self::new(format!("Stage '{stage}' cannot depend on itself"))
            .with_stages(vec![stage.to_string()])
            .with_error_info(ContractErrorInfo::new(
                "WORKFLOW-CYCLE",
                format!("Stage '{stage}' depends on itself"),
            ))
    }

    /// A stage identifier is empty or contains unsupported characters.
    #[must_use]
    pub fn invalid_identifier(stage: &str) -> Self {
        Self::new(format!("Invalid stage identifier '{stage}'"))
            .with_stages(vec![stage.to_string()])
            .with_error_info(
                ContractErrorInfo::new("WORKFLOW-IDENTIFIER", "Malformed stage identifier")
                    .with_fix_hint(
                        "Use lowercase letters, digits, '_' or '-', starting with a letter.",
                    ),
            )
    }

    /// The workflow has no stages.
    #[must_use]
    pub fn empty(workflow: &str) -> Self {
        Self::new(format!("Workflow '{workflow}' has no stages")).with_error_info(
            ContractErrorInfo::new("WORKFLOW-EMPTY", "Cannot build an empty workflow")
                .with_fix_hint("Add at least one stage before building."),
        )
    }

    /// A stage's per-stage configuration is unusable.
    #[must_use]
    pub fn invalid_stage_config(stage: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(format!("Stage '{stage}' is misconfigured: {reason}"))
            .with_stages(vec![stage.to_string()])
            .with_error_info(ContractErrorInfo::new("WORKFLOW-STAGE-CONFIG", reason))
    }

    /// Two composed workflows disagree on a stage.
    #[must_use]
    pub fn conflict(stage: &str) -> Self {
        Self::new(format!("Conflicting stage definitions for '{stage}'"))
            .with_stages(vec![stage.to_string()])
            .with_error_info(
                ContractErrorInfo::new(
                    "WORKFLOW-CONFLICT",
                    format!("Stage '{stage}' has different definitions in composed workflows"),
                )
                .with_fix_hint("Rename one of the stages or make their configurations identical."),
            )
    }

    /// No capability is registered for a stage's capability kind.
    #[must_use]
    pub fn missing_capability(stage: &str, kind: &str) -> Self {
        Self::new(format!(
            "Stage '{stage}' requires capability '{kind}' which is not registered"
        ))
        .with_stages(vec![stage.to_string()])
        .with_error_info(
            ContractErrorInfo::new("WORKFLOW-CAPABILITY", format!("Capability '{kind}' not found"))
                .with_context_entry("capability", kind),
        )
    }
}

/// Error raised when a submitted request is malformed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid request: {message}")]
pub struct ValidationError {
    /// The offending field, when one can be named.
    pub field: Option<String>,
    /// The error message.
    pub message: String,
}

impl ValidationError {
    /// Creates a validation error not tied to a field.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            field: None,
            message: message.into(),
        }
    }

    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            message: format!("field '{field}': {}", message.into()),
            field: Some(field),
        }
    }
}

/// Failure reported by an agent capability.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct CapabilityError {
    /// The error message.
    pub message: String,
    /// Whether this failure may be retried. `None` defers to the stage's
    /// retry policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl CapabilityError {
    /// Creates an error that defers retry eligibility to the stage policy.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: None,
        }
    }

    /// Creates an error the capability declares transient.
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: Some(true),
        }
    }

    /// Creates an error the capability declares permanent.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: Some(false),
        }
    }

    /// Resolves retry eligibility against the stage default.
    #[must_use]
    pub fn is_retryable_or(&self, stage_default: bool) -> bool {
        self.retryable.unwrap_or(stage_default)
    }
}

/// A stage exceeded its deadline. Always retryable up to the attempt limit.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Stage '{stage}' timed out after {}ms", timeout.as_millis())]
pub struct TimeoutError {
    /// The stage that timed out.
    pub stage: String,
    /// The configured deadline.
    pub timeout: Duration,
}

impl TimeoutError {
    /// Creates a new timeout error.
    #[must_use]
    pub fn new(stage: impl Into<String>, timeout: Duration) -> Self {
        Self {
            stage: stage.into(),
            timeout,
        }
    }
}

/// A result was requested for a task that has not finished.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Task {task_id} is not terminal (status: {status})")]
pub struct NotTerminalError {
    /// The task.
    pub task_id: TaskId,
    /// Its current status.
    pub status: TaskStatus,
}

/// Illegal stage state machine transition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Illegal transition for stage '{stage}': {from} -> {to}")]
pub struct TransitionError {
    /// The stage.
    pub stage: String,
    /// The current status.
    pub from: StageStatus,
    /// The requested status.
    pub to: StageStatus,
}

/// Errors raised by task store implementations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// No task with this identifier exists.
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// A task with this identifier already exists.
    #[error("Task already exists: {0}")]
    TaskExists(TaskId),

    /// The optimistic concurrency token did not match.
    #[error("Version conflict on task {task_id}: expected {expected}, found {actual}")]
    VersionConflict {
        /// The task.
        task_id: TaskId,
        /// The version the writer read.
        expected: u64,
        /// The version currently stored.
        actual: u64,
    },

    /// The task has no execution record for a stage.
    #[error("Stage '{stage}' not found on task {task_id}")]
    StageNotFound {
        /// The task.
        task_id: TaskId,
        /// The stage.
        stage: String,
    },
}
