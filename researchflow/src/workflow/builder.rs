//! Workflow builder with composition.

use super::{FailureMode, InputSchema, RetryPolicy, StageSpec, WorkflowDefinition};
use crate::capability::CapabilityKind;
use crate::errors::GraphError;
use std::collections::HashMap;
use std::time::Duration;

/// Builder for creating validated workflows.
///
/// Stages may be added in any order; references are resolved and the graph
/// validated in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    name: String,
    stages: Vec<StageSpec>,
    input_schema: InputSchema,
    failure_mode: FailureMode,
}

impl WorkflowBuilder {
    /// Creates a new workflow builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            input_schema: InputSchema::any(),
            failure_mode: FailureMode::default(),
        }
    }

    /// The standard research pipeline: plan, collect, analyze, write.
    ///
    /// Every stage gets the same retry policy and timeout; requests are
    /// checked against [`InputSchema::research`].
    #[must_use]
    pub fn research(name: impl Into<String>, retry: &RetryPolicy, timeout: Duration) -> Self {
        let stage = |id: &str, kind: CapabilityKind| {
            StageSpec::new(id, kind)
                .with_retry(retry.clone())
                .with_timeout(timeout)
        };
        Self::new(name)
            .stage(stage("plan", CapabilityKind::Planner))
            .stage(stage("collect", CapabilityKind::Collector).depends_on("plan"))
            .stage(stage("analyze", CapabilityKind::Analyzer).depends_on("collect"))
            .stage(stage("write", CapabilityKind::Writer).depends_on("analyze"))
            .with_input_schema(InputSchema::research())
    }

    /// Adds a stage.
    #[must_use]
    pub fn stage(mut self, spec: StageSpec) -> Self {
        self.stages.push(spec);
        self
    }

    /// Adds several stages.
    #[must_use]
    pub fn stages(mut self, specs: impl IntoIterator<Item = StageSpec>) -> Self {
        self.stages.extend(specs);
        self
    }

    /// Sets the request schema.
    #[must_use]
    pub fn with_input_schema(mut self, schema: InputSchema) -> Self {
        self.input_schema = schema;
        self
    }

    /// Sets the failure mode.
    #[must_use]
    pub const fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    /// Composes this builder with another.
    ///
    /// Stages present in both must agree on capability, retry policy, timeout
    /// and the required flag; their dependency sets are merged, and an edge
    /// explicitly required on either side stays required. The schema and
    /// failure mode of `self` are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if there are conflicting stage definitions.
    pub fn compose(mut self, other: Self) -> Result<Self, GraphError> {
        self.name = format!("{}+{}", self.name, other.name);

        let positions: HashMap<String, usize> = self
            .stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();

        for other_spec in other.stages {
            match positions.get(&other_spec.id) {
                Some(&i) => {
                    let existing = &mut self.stages[i];
                    if !specs_compatible(existing, &other_spec) {
                        return Err(GraphError::conflict(&other_spec.id));
                    }
                    for dep in other_spec.dependencies {
                        existing.add_dependency(dep);
                    }
                }
                None => self.stages.push(other_spec),
            }
        }

        Ok(self)
    }

    /// Validates and builds the workflow definition.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphError`] if the graph is empty, cyclic, references
    /// unknown stages, repeats an identifier or contains a malformed stage.
    pub fn build(self) -> Result<WorkflowDefinition, GraphError> {
        WorkflowDefinition::from_parts(
            self.name,
            self.stages,
            self.input_schema,
            self.failure_mode,
        )
    }

    /// Returns the workflow name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }
}

fn specs_compatible(a: &StageSpec, b: &StageSpec) -> bool {
    a.capability == b.capability
        && a.required == b.required
        && a.timeout == b.timeout
        && a.retry == b.retry
}
