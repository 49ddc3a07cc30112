//! Stage specifications.

use super::RetryPolicy;
use crate::capability::CapabilityKind;
use crate::errors::GraphError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

/// Default per-stage deadline.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(30);

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z][a-z0-9_-]{0,63}$").unwrap_or_else(|_| unreachable!())
    })
}

/// Returns true if `id` is a well-formed stage identifier.
#[must_use]
pub fn is_valid_identifier(id: &str) -> bool {
    identifier_pattern().is_match(id)
}

/// An edge from a stage to one of its upstream stages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    /// The upstream stage identifier.
    pub stage: String,
    /// Whether the edge is satisfied by any terminal upstream state rather
    /// than only by success. `None` follows the upstream stage: the edge is
    /// optional exactly when the upstream stage is not required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
}

impl Dependency {
    /// A dependency whose strictness follows the upstream stage.
    #[must_use]
    pub fn on(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            optional: None,
        }
    }

    /// A dependency that must succeed.
    #[must_use]
    pub fn required(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            optional: Some(false),
        }
    }

    /// A dependency that only has to finish.
    #[must_use]
    pub fn optional(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            optional: Some(true),
        }
    }

    /// Returns true if any terminal upstream state satisfies the edge.
    ///
    /// An unresolved edge counts as required.
    #[must_use]
    pub fn is_optional(&self) -> bool {
        self.optional == Some(true)
    }

    /// Merges a second declaration of the same edge. Required beats
    /// unresolved, which beats optional.
    fn merge(&mut self, other: &Self) {
        self.optional = match (self.optional, other.optional) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        };
    }
}

/// Specification for a single stage in a workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    /// The unique identifier of the stage.
    pub id: String,
    /// The capability kind the stage invokes.
    pub capability: CapabilityKind,
    /// Upstream edges, one per upstream stage.
    pub dependencies: Vec<Dependency>,
    /// Retry policy.
    pub retry: RetryPolicy,
    /// Deadline for a single attempt.
    pub timeout: Duration,
    /// Whether the task can only complete if this stage succeeds.
    pub required: bool,
}

impl StageSpec {
    /// Creates a required stage with default retry policy and timeout.
    #[must_use]
    pub fn new(id: impl Into<String>, capability: CapabilityKind) -> Self {
        Self {
            id: id.into(),
            capability,
            dependencies: Vec::new(),
            retry: RetryPolicy::default(),
            timeout: DEFAULT_STAGE_TIMEOUT,
            required: true,
        }
    }

    /// Adds a dependency that is as strict as the upstream stage: required
    /// on a required stage, optional on an optional one.
    #[must_use]
    pub fn depends_on(mut self, stage: impl Into<String>) -> Self {
        self.add_dependency(Dependency::on(stage));
        self
    }

    /// Adds a dependency that must succeed even if the upstream stage is
    /// optional.
    #[must_use]
    pub fn depends_on_required(mut self, stage: impl Into<String>) -> Self {
        self.add_dependency(Dependency::required(stage));
        self
    }

    /// Adds an optional dependency.
    #[must_use]
    pub fn depends_on_optional(mut self, stage: impl Into<String>) -> Self {
        self.add_dependency(Dependency::optional(stage));
        self
    }

    /// Adds several dependencies, each following its upstream stage.
    #[must_use]
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        for dep in deps {
            self.add_dependency(Dependency::on(dep));
        }
        self
    }

    /// Adds an edge, merging with an existing edge to the same stage.
    ///
    /// When two declarations disagree, an explicitly required edge wins.
    pub fn add_dependency(&mut self, dependency: Dependency) {
        if let Some(existing) = self
            .dependencies
            .iter_mut()
            .find(|d| d.stage == dependency.stage)
        {
            existing.merge(&dependency);
        } else {
            self.dependencies.push(dependency);
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the maximum attempts, keeping the rest of the retry policy.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.retry.max_attempts = attempts;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Marks the stage as optional for task completion.
    #[must_use]
    pub const fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Returns the edge to `stage`, if any.
    #[must_use]
    pub fn dependency(&self, stage: &str) -> Option<&Dependency> {
        self.dependencies.iter().find(|d| d.stage == stage)
    }

    /// Returns the upstream stage identifiers.
    pub fn dependency_ids(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().map(|d| d.stage.as_str())
    }

    /// Validates the stage on its own (graph-level checks live on the
    /// workflow definition).
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed identifier, a self-dependency, zero
    /// attempts or a zero timeout.
    pub fn validate(&self) -> Result<(), GraphError> {
        if !is_valid_identifier(&self.id) {
            return Err(GraphError::invalid_identifier(&self.id));
        }
        if self.dependency(&self.id).is_some() {
            return Err(GraphError::self_dependency(&self.id));
        }
        if self.retry.max_attempts == 0 {
            return Err(GraphError::invalid_stage_config(
                &self.id,
                "max_attempts must be at least 1",
            ));
        }
        if self.timeout.is_zero() {
            return Err(GraphError::invalid_stage_config(
                &self.id,
                "timeout must be greater than zero",
            ));
        }
        Ok(())
    }
}
