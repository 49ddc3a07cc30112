//! Validated, immutable workflow definitions.

use super::{FailureMode, InputSchema, StageSpec};
use crate::errors::GraphError;
use std::collections::{HashMap, HashSet, VecDeque};

/// A validated workflow: an acyclic graph of stage specifications.
///
/// Obtained only through [`WorkflowBuilder::build`](super::WorkflowBuilder::build)
/// and shared behind an `Arc` once registered.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    name: String,
    stages: Vec<StageSpec>,
    index: HashMap<String, usize>,
    order: Vec<String>,
    input_schema: InputSchema,
    failure_mode: FailureMode,
}

impl WorkflowDefinition {
    pub(crate) fn from_parts(
        name: String,
        mut stages: Vec<StageSpec>,
        input_schema: InputSchema,
        failure_mode: FailureMode,
    ) -> Result<Self, GraphError> {
        let order = check_graph(&name, &stages)?;

        let index = stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();

        let required: HashMap<String, bool> = stages
            .iter()
            .map(|s| (s.id.clone(), s.required))
            .collect();
        // Unresolved edges take the strictness of their upstream stage.
        for spec in &mut stages {
            for dep in &mut spec.dependencies {
                if dep.optional.is_none() {
                    dep.optional = required.get(&dep.stage).map(|r| !r);
                }
            }
        }

        Ok(Self {
            name,
            stages,
            index,
            order,
            input_schema,
            failure_mode,
        })
    }

    /// Re-checks every structural invariant of the definition.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphError`] describing the first violation: empty
    /// workflow, malformed stage, duplicate identifier, dangling dependency
    /// or cycle (with its path).
    pub fn validate(&self) -> Result<(), GraphError> {
        check_graph(&self.name, &self.stages).map(|_| ())
    }

    /// Returns the workflow name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the stages in declaration order.
    #[must_use]
    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    /// Looks up a stage.
    #[must_use]
    pub fn stage(&self, id: &str) -> Option<&StageSpec> {
        self.index.get(id).map(|&i| &self.stages[i])
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Returns stage identifiers in a deterministic topological order.
    #[must_use]
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Returns the request schema.
    #[must_use]
    pub fn input_schema(&self) -> &InputSchema {
        &self.input_schema
    }

    /// Returns the failure mode.
    #[must_use]
    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }
}

/// Checks structure and returns the topological order.
fn check_graph(name: &str, stages: &[StageSpec]) -> Result<Vec<String>, GraphError> {
    if stages.is_empty() {
        return Err(GraphError::empty(name));
    }

    let mut by_id: HashMap<&str, &StageSpec> = HashMap::with_capacity(stages.len());
    for spec in stages {
        spec.validate()?;
        if by_id.insert(spec.id.as_str(), spec).is_some() {
            return Err(GraphError::duplicate_stage(&spec.id));
        }
    }

    for spec in stages {
        for dep in spec.dependency_ids() {
            if !by_id.contains_key(dep) {
                return Err(GraphError::missing_dependency(&spec.id, dep));
            }
        }
    }

    detect_cycles(stages, &by_id)?;
    Ok(topological_sort(stages, &by_id))
}

fn detect_cycles(
    stages: &[StageSpec],
    by_id: &HashMap<&str, &StageSpec>,
) -> Result<(), GraphError> {
    let mut visited = HashSet::new();
    let mut on_path = HashSet::new();
    let mut path = Vec::new();

    for spec in stages {
        if !visited.contains(spec.id.as_str()) {
            if let Some(cycle) =
                dfs_cycle(&spec.id, by_id, &mut visited, &mut on_path, &mut path)
            {
                return Err(GraphError::cycle(cycle));
            }
        }
    }
    Ok(())
}

fn dfs_cycle<'a>(
    node: &'a str,
    by_id: &HashMap<&'a str, &'a StageSpec>,
    visited: &mut HashSet<&'a str>,
    on_path: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    visited.insert(node);
    on_path.insert(node);
    path.push(node);

    if let Some(&spec) = by_id.get(node) {
        for dep in spec.dependency_ids() {
            if on_path.contains(dep) {
                let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                let mut cycle: Vec<String> =
                    path[start..].iter().map(|s| (*s).to_string()).collect();
                cycle.push(dep.to_string());
                return Some(cycle);
            }
            if !visited.contains(dep) {
                if let Some(cycle) = dfs_cycle(dep, by_id, visited, on_path, path) {
                    return Some(cycle);
                }
            }
        }
    }

    path.pop();
    on_path.remove(node);
    None
}

/// Kahn's algorithm, breaking ties by declaration order.
fn topological_sort(stages: &[StageSpec], by_id: &HashMap<&str, &StageSpec>) -> Vec<String> {
    let position: HashMap<&str, usize> = stages
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut in_degree: Vec<usize> = stages.iter().map(|s| s.dependencies.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];
    for (i, spec) in stages.iter().enumerate() {
        for dep in spec.dependency_ids() {
            if let Some(&d) = position.get(dep) {
                dependents[d].push(i);
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..stages.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(stages.len());

    while let Some(i) = ready.pop_front() {
        order.push(stages[i].id.clone());
        let mut unlocked = Vec::new();
        for &d in &dependents[i] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                unlocked.push(d);
            }
        }
        unlocked.sort_unstable();
        ready.extend(unlocked);
    }

    debug_assert_eq!(order.len(), by_id.len());
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityKind;
    use crate::workflow::{Dependency, WorkflowBuilder};
    use pretty_assertions::assert_eq;

    fn stage(id: &str) -> StageSpec {
        StageSpec::new(id, CapabilityKind::custom(id))
    }

    fn research() -> WorkflowDefinition {
        WorkflowBuilder::new("research")
            .stage(StageSpec::new("plan", CapabilityKind::Planner))
            .stage(StageSpec::new("collect", CapabilityKind::Collector).depends_on("plan"))
            .stage(StageSpec::new("analyze", CapabilityKind::Analyzer).depends_on("collect"))
            .stage(StageSpec::new("write", CapabilityKind::Writer).depends_on("analyze"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_linear_topological_order() {
        let def = research();
        assert_eq!(def.topological_order(), ["plan", "collect", "analyze", "write"]);
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_order_respects_dependencies_declared_out_of_order() {
        let def = WorkflowBuilder::new("wf")
            .stage(stage("merge").depends_on("left").depends_on("right"))
            .stage(stage("right").depends_on("root"))
            .stage(stage("left").depends_on("root"))
            .stage(stage("root"))
            .build()
            .unwrap();

        assert_eq!(def.topological_order(), ["root", "right", "left", "merge"]);
    }

    #[test]
    fn test_cycle_reports_path() {
        let err = WorkflowBuilder::new("wf")
            .stage(stage("a").depends_on("c"))
            .stage(stage("b").depends_on("a"))
            .stage(stage("c").depends_on("b"))
            .build()
            .unwrap_err();

        assert_eq!(err.code(), Some("WORKFLOW-CYCLE"));
        assert_eq!(err.stages, vec!["a", "c", "b", "a"]);
        assert!(err.message.contains("a -> c -> b -> a"));
    }

    #[test]
    fn test_missing_dependency() {
        let err = WorkflowBuilder::new("wf")
            .stage(stage("collect").depends_on("plan"))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some("WORKFLOW-MISSING-DEP"));
        assert_eq!(err.stages, vec!["collect", "plan"]);
    }

    #[test]
    fn test_empty_workflow() {
        let err = WorkflowBuilder::new("wf").build().unwrap_err();
        assert_eq!(err.code(), Some("WORKFLOW-EMPTY"));
    }

    #[test]
    fn test_lookup() {
        let def = WorkflowBuilder::new("wf")
            .stage(stage("a"))
            .stage(stage("b").optional())
            .build()
            .unwrap();

        assert!(def.stage("a").is_some_and(|s| s.required));
        assert!(def.stage("b").is_some());
        assert!(def.stage("z").is_none());
        assert_eq!(def.stage_count(), 2);
        assert_eq!(def.failure_mode(), FailureMode::ContinueOnFailure);
    }

    #[test]
    fn test_edges_follow_upstream_required_flag() {
        let def = WorkflowBuilder::new("wf")
            .stage(stage("plan"))
            .stage(stage("analyze").depends_on("plan").optional())
            .stage(stage("write").depends_on("plan").depends_on("analyze"))
            .stage(stage("review").depends_on_required("analyze"))
            .build()
            .unwrap();

        let write = def.stage("write").unwrap();
        assert_eq!(
            write.dependencies,
            vec![Dependency::required("plan"), Dependency::optional("analyze")]
        );
        let review = def.stage("review").unwrap();
        assert_eq!(review.dependencies, vec![Dependency::required("analyze")]);
    }
}
