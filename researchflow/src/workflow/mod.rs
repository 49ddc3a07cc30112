//! Workflow definitions.
//!
//! This module provides:
//! - Stage specifications with dependencies, retry policy and timeout
//! - Request input schemas
//! - A builder with composition and validation
//! - Validated, immutable workflow definitions

mod builder;
mod definition;
mod retry;
mod schema;
mod spec;

pub use builder::WorkflowBuilder;
pub use definition::WorkflowDefinition;
pub use retry::{BackoffStrategy, JitterStrategy, RetryPolicy};
pub use schema::{FieldKind, FieldRule, InputSchema};
pub use spec::{is_valid_identifier, Dependency, StageSpec, DEFAULT_STAGE_TIMEOUT};

use serde::{Deserialize, Serialize};

/// How a task reacts once a required stage has terminally failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Keep running branches that do not depend on the failure (default).
    #[default]
    ContinueOnFailure,
    /// Stop dispatching and skip every stage that has not started.
    FailFast,
}
