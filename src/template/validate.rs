// Structural validation of step definitions
//
// Applied on template create/update and on ad hoc instance creation. The
// dependency graph is checked with Kahn's algorithm: any step left unvisited
// after the sort sits on a cycle.

use std::collections::{BTreeMap, HashMap, HashSet};

use super::types::{StepDefinition, StepKey, StepType, TemplateDraft};
use crate::error::{Result, WorkflowError};

/// Validate a template draft and return its steps in dependency order
pub fn validate_draft(draft: &TemplateDraft) -> Result<Vec<StepKey>> {
    if draft.name.trim().is_empty() {
        return Err(WorkflowError::Validation(
            "Template name cannot be empty".to_string(),
        ));
    }
    validate_steps(&draft.steps)
}

/// Validate a step list and return the keys in a topological order
pub fn validate_steps(steps: &[StepDefinition]) -> Result<Vec<StepKey>> {
    if steps.is_empty() {
        return Err(WorkflowError::Validation(
            "Workflow must have at least one step".to_string(),
        ));
    }

    let mut keys = HashSet::new();
    let mut orders = HashMap::new();
    for step in steps {
        if step.key.trim().is_empty() {
            return Err(WorkflowError::Validation(
                "Step key cannot be empty".to_string(),
            ));
        }
        if step.name.trim().is_empty() {
            return Err(WorkflowError::Validation(format!(
                "Step '{}' name cannot be empty",
                step.key
            )));
        }
        if step.stage.trim().is_empty() {
            return Err(WorkflowError::Validation(format!(
                "Step '{}' stage cannot be empty",
                step.key
            )));
        }
        if !keys.insert(step.key.as_str()) {
            return Err(WorkflowError::Validation(format!(
                "Duplicate step key: {}",
                step.key
            )));
        }
        if let Some(previous) = orders.insert(step.order, step.key.as_str()) {
            return Err(WorkflowError::Validation(format!(
                "Steps '{}' and '{}' share order {}",
                previous, step.key, step.order
            )));
        }
        if step.integration.is_some() && step.step_type != StepType::Integration {
            return Err(WorkflowError::Validation(format!(
                "Step '{}' binds an integration but is a {} step",
                step.key, step.step_type
            )));
        }
    }

    for step in steps {
        for dependency in &step.dependencies {
            if dependency == &step.key {
                return Err(WorkflowError::Validation(format!(
                    "Step '{}' cannot depend on itself",
                    step.key
                )));
            }
            if !keys.contains(dependency.as_str()) {
                return Err(WorkflowError::Validation(format!(
                    "Step '{}' depends on unknown step '{}'",
                    step.key, dependency
                )));
            }
        }
    }

    topological_order(steps)
}

/// Kahn's algorithm over the step graph; ties broken by step order
fn topological_order(steps: &[StepDefinition]) -> Result<Vec<StepKey>> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    let order_of: HashMap<&str, u32> = steps.iter().map(|s| (s.key.as_str(), s.order)).collect();

    for step in steps {
        in_degree.insert(step.key.as_str(), step.dependencies.len());
        for dependency in &step.dependencies {
            dependents
                .entry(dependency.as_str())
                .or_default()
                .push(step.key.as_str());
        }
    }

    let mut ready: BTreeMap<u32, &str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(key, _)| (order_of[key], *key))
        .collect();
    let mut sorted = Vec::with_capacity(steps.len());

    while let Some((_, key)) = ready.pop_first() {
        sorted.push(key.to_string());

        if let Some(children) = dependents.get(key) {
            for child in children {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(order_of[child], *child);
                    }
                }
            }
        }
    }

    if sorted.len() != steps.len() {
        let visited: HashSet<&str> = sorted.iter().map(String::as_str).collect();
        let mut unvisited: Vec<String> = steps
            .iter()
            .filter(|s| !visited.contains(s.key.as_str()))
            .map(|s| s.key.clone())
            .collect();
        unvisited.sort();
        return Err(WorkflowError::CyclicDependency { steps: unvisited });
    }

    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::integration::IntegrationType;
    use crate::template::types::{AssigneeRole, WorkflowType};

    fn step(key: &str, order: u32) -> StepDefinition {
        StepDefinition::new(key, order, key, StepType::Manual, AssigneeRole::Hr)
    }

    #[test]
    fn test_linear_chain_sorts_in_dependency_order() {
        let steps = vec![
            step("background-check", 1).depends_on("sign-offer"),
            step("send-offer", 2),
            step("sign-offer", 3).depends_on("send-offer"),
        ];
        let order = validate_steps(&steps).unwrap();
        assert_eq!(order, vec!["send-offer", "sign-offer", "background-check"]);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let steps = vec![
            step("a", 1).depends_on("c"),
            step("b", 2).depends_on("a"),
            step("c", 3).depends_on("b"),
            step("d", 4),
        ];
        let err = validate_steps(&steps).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CyclicDependency);
        assert_eq!(
            err,
            WorkflowError::CyclicDependency {
                steps: vec!["a".to_string(), "b".to_string(), "c".to_string()]
            }
        );
    }

    #[test]
    fn test_steps_downstream_of_cycle_are_reported() {
        let steps = vec![
            step("a", 1).depends_on("b"),
            step("b", 2).depends_on("a"),
            step("c", 3).depends_on("a"),
        ];
        match validate_steps(&steps) {
            Err(WorkflowError::CyclicDependency { steps }) => {
                assert_eq!(steps, vec!["a", "b", "c"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_order_is_rejected() {
        let steps = vec![step("a", 1), step("b", 1)];
        let err = validate_steps(&steps).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let steps = vec![step("a", 1).depends_on("missing")];
        let err = validate_steps(&steps).unwrap_err();
        assert!(err.to_string().contains("unknown step 'missing'"));
    }

    #[test]
    fn test_self_dependency_is_rejected() {
        let steps = vec![step("a", 1).depends_on("a")];
        assert_eq!(validate_steps(&steps).unwrap_err().kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_integration_binding_requires_integration_step() {
        let steps = vec![step("a", 1).with_integration(IntegrationType::Docusign, serde_json::json!({}))];
        assert_eq!(validate_steps(&steps).unwrap_err().kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_empty_template_is_rejected() {
        let draft = TemplateDraft::new("empty", WorkflowType::Leave, vec![]);
        assert_eq!(validate_draft(&draft).unwrap_err().kind(), ErrorKind::Validation);

        let unnamed = TemplateDraft::new("  ", WorkflowType::Leave, vec![step("a", 1)]);
        assert_eq!(validate_draft(&unnamed).unwrap_err().kind(), ErrorKind::Validation);
    }
}
