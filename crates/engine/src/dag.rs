//! DAG validation. Run this before persisting or executing a workflow.
//!
//! Rules enforced:
//! 1. Step IDs must be non-empty and unique within the definition.
//! 2. Every `depends_on` entry must name another step of the definition.
//! 3. The dependency graph must be acyclic. Checked with a depth-first search
//!    over a recursion stack so the offending cycle can be reported.
//!
//! Returns the steps in execution order on success: dependencies first, ties
//! broken by definition order.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::{models::WorkflowDefinition, EngineError};

/// Validate the definition's dependency graph and return step ids in execution order.
///
/// # Errors
/// - [`EngineError::InvalidDefinition`] for an empty step id or a self-dependency.
/// - [`EngineError::DuplicateStepId`] if two steps share an id.
/// - [`EngineError::UnknownDependency`] if `depends_on` names a missing step.
/// - [`EngineError::CycleDetected`] with the cycle path if the graph is not acyclic.
pub fn validate_dag(definition: &WorkflowDefinition) -> Result<Vec<String>, EngineError> {
    // -----------------------------------------------------------------------
    // 1. Ids
    // -----------------------------------------------------------------------
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, step) in definition.steps.iter().enumerate() {
        if step.id.trim().is_empty() {
            return Err(EngineError::InvalidDefinition(format!("step #{i} has an empty id")));
        }
        if index.insert(step.id.as_str(), i).is_some() {
            return Err(EngineError::DuplicateStepId(step.id.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // 2. Dependency references
    // -----------------------------------------------------------------------
    for step in &definition.steps {
        for dep in &step.depends_on {
            if dep == &step.id {
                return Err(EngineError::CycleDetected { path: vec![step.id.clone(), step.id.clone()] });
            }
            if !index.contains_key(dep.as_str()) {
                return Err(EngineError::UnknownDependency { step: step.id.clone(), dependency: dep.clone() });
            }
        }
    }

    // -----------------------------------------------------------------------
    // 3. Cycle detection (DFS with recursion stack)
    // -----------------------------------------------------------------------
    let mut done: HashSet<usize> = HashSet::new();
    for start in 0..definition.steps.len() {
        let mut stack: Vec<usize> = Vec::new();
        if let Some(cycle) = find_cycle(definition, &index, start, &mut stack, &mut done) {
            return Err(EngineError::CycleDetected { path: cycle });
        }
    }

    // -----------------------------------------------------------------------
    // 4. Execution order (Kahn, lowest definition index first)
    // -----------------------------------------------------------------------
    let mut remaining: Vec<usize> = definition.steps.iter().map(|s| s.depends_on.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); definition.steps.len()];
    for (i, step) in definition.steps.iter().enumerate() {
        for dep in &step.depends_on {
            dependents[index[dep.as_str()]].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..definition.steps.len()).filter(|&i| remaining[i] == 0).collect();
    let mut order = Vec::with_capacity(definition.steps.len());
    while let Some(next) = ready.pop_first() {
        order.push(definition.steps[next].id.clone());
        for &child in &dependents[next] {
            remaining[child] -= 1;
            if remaining[child] == 0 {
                ready.insert(child);
            }
        }
    }

    Ok(order)
}

/// Returns the cycle (first node repeated at the end) reachable from `node`, if any.
fn find_cycle(
    definition: &WorkflowDefinition,
    index: &HashMap<&str, usize>,
    node: usize,
    stack: &mut Vec<usize>,
    done: &mut HashSet<usize>,
) -> Option<Vec<String>> {
    if done.contains(&node) {
        return None;
    }
    if let Some(pos) = stack.iter().position(|&n| n == node) {
        let mut path: Vec<String> = stack[pos..].iter().map(|&n| definition.steps[n].id.clone()).collect();
        path.push(definition.steps[node].id.clone());
        return Some(path);
    }

    stack.push(node);
    for dep in &definition.steps[node].depends_on {
        if let Some(cycle) = find_cycle(definition, index, index[dep.as_str()], stack, done) {
            return Some(cycle);
        }
    }
    stack.pop();
    done.insert(node);
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WorkflowStep;

    fn def(steps: Vec<WorkflowStep>) -> WorkflowDefinition {
        WorkflowDefinition::new("test", steps)
    }

    #[test]
    fn linear_chain_sorts_in_dependency_order() {
        let d = def(vec![
            WorkflowStep::new("c", "x").depends_on(&["b"]),
            WorkflowStep::new("a", "x"),
            WorkflowStep::new("b", "x").depends_on(&["a"]),
        ]);
        assert_eq!(validate_dag(&d).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn definition_order_breaks_ties() {
        let d = def(vec![
            WorkflowStep::new("p", "x").depends_on(&["q"]),
            WorkflowStep::new("r", "x"),
            WorkflowStep::new("q", "x"),
        ]);
        assert_eq!(validate_dag(&d).unwrap(), vec!["r", "q", "p"]);
    }

    #[test]
    fn diamond_is_valid() {
        let d = def(vec![
            WorkflowStep::new("read", "x"),
            WorkflowStep::new("left", "x").depends_on(&["read"]),
            WorkflowStep::new("right", "x").depends_on(&["read"]),
            WorkflowStep::new("join", "x").depends_on(&["left", "right"]),
        ]);
        assert_eq!(validate_dag(&d).unwrap(), vec!["read", "left", "right", "join"]);
    }

    #[test]
    fn duplicate_step_id_is_rejected() {
        let d = def(vec![WorkflowStep::new("a", "x"), WorkflowStep::new("a", "y")]);
        assert!(matches!(validate_dag(&d), Err(EngineError::DuplicateStepId(id)) if id == "a"));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let d = def(vec![WorkflowStep::new("a", "x").depends_on(&["ghost"])]);
        assert!(matches!(
            validate_dag(&d),
            Err(EngineError::UnknownDependency { step, dependency }) if step == "a" && dependency == "ghost"
        ));
    }

    #[test]
    fn cycle_reports_its_path() {
        let d = def(vec![
            WorkflowStep::new("a", "x").depends_on(&["c"]),
            WorkflowStep::new("b", "x").depends_on(&["a"]),
            WorkflowStep::new("c", "x").depends_on(&["b"]),
        ]);
        match validate_dag(&d) {
            Err(EngineError::CycleDetected { path }) => assert_eq!(path, vec!["a", "c", "b", "a"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let d = def(vec![WorkflowStep::new("a", "x").depends_on(&["a"])]);
        assert!(matches!(validate_dag(&d), Err(EngineError::CycleDetected { .. })));
    }

    #[test]
    fn empty_id_is_rejected() {
        let d = def(vec![WorkflowStep::new(" ", "x")]);
        assert!(matches!(validate_dag(&d), Err(EngineError::InvalidDefinition(_))));
    }

    #[test]
    fn single_step_is_valid() {
        let d = def(vec![WorkflowStep::new("solo", "x")]);
        assert_eq!(validate_dag(&d).unwrap(), vec!["solo"]);
    }
}
