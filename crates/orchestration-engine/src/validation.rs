//! Workflow definition validation
//!
//! Checks identifiers, dependency references and acyclicity. All problems
//! are collected so a caller sees every reason a definition was rejected.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::types::WorkflowDefinition;

/// Validation error with location context
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyWorkflowId,
    /// The id cannot be used as a file name in the persistence directory
    UnsafeWorkflowId { workflow_id: String },
    NoSteps,
    EmptyStepId { index: usize },
    DuplicateStepId { step_id: String },
    EmptyOperationType { step_id: String },
    /// A dependency map key is not a declared step
    UnknownDependent { step_id: String },
    /// A step depends on an id that is not a declared step
    UnknownDependency { step_id: String, dependency: String },
    SelfDependency { step_id: String },
    CycleDetected { steps: Vec<String> },
    ZeroConcurrency,
    FailureThresholdOutOfRange { value: f64 },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyWorkflowId => write!(f, "Workflow id is empty"),
            Self::UnsafeWorkflowId { workflow_id } => write!(
                f,
                "Workflow id '{}' may only use letters, digits, '-', '_' and '.', and must not start with '.'",
                workflow_id
            ),
            Self::NoSteps => write!(f, "Workflow has no steps"),
            Self::EmptyStepId { index } => write!(f, "Step at index {} has an empty id", index),
            Self::DuplicateStepId { step_id } => write!(f, "Duplicate step id '{}'", step_id),
            Self::EmptyOperationType { step_id } => {
                write!(f, "Step '{}' has an empty operation type", step_id)
            }
            Self::UnknownDependent { step_id } => {
                write!(f, "Dependencies declared for unknown step '{}'", step_id)
            }
            Self::UnknownDependency {
                step_id,
                dependency,
            } => write!(
                f,
                "Step '{}' depends on unknown step '{}'",
                step_id, dependency
            ),
            Self::SelfDependency { step_id } => write!(f, "Step '{}' depends on itself", step_id),
            Self::CycleDetected { steps } => {
                write!(f, "Dependency cycle among steps: {}", steps.join(", "))
            }
            Self::ZeroConcurrency => write!(f, "maxConcurrency must be at least 1"),
            Self::FailureThresholdOutOfRange { value } => {
                write!(f, "failureThreshold {} is outside [0, 1]", value)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validate a workflow definition
///
/// Returns all validation errors found (not just the first).
pub fn validate_workflow(workflow: &WorkflowDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if workflow.id.trim().is_empty() {
        errors.push(ValidationError::EmptyWorkflowId);
    } else if !is_safe_workflow_id(&workflow.id) {
        errors.push(ValidationError::UnsafeWorkflowId {
            workflow_id: workflow.id.clone(),
        });
    }
    if workflow.steps.is_empty() {
        errors.push(ValidationError::NoSteps);
    }
    if workflow.max_concurrency == 0 {
        errors.push(ValidationError::ZeroConcurrency);
    }
    let threshold = workflow.error_policy.failure_threshold;
    if !(0.0..=1.0).contains(&threshold) {
        errors.push(ValidationError::FailureThresholdOutOfRange { value: threshold });
    }

    validate_steps(workflow, &mut errors);
    validate_dependency_references(workflow, &mut errors);
    detect_cycles(workflow, &mut errors);

    errors
}

/// Workflow ids name files on disk, so path separators and leading dots are out
fn is_safe_workflow_id(id: &str) -> bool {
    !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn validate_steps(workflow: &WorkflowDefinition, errors: &mut Vec<ValidationError>) {
    let mut seen = HashSet::new();
    for (index, step) in workflow.steps.iter().enumerate() {
        if step.id.trim().is_empty() {
            errors.push(ValidationError::EmptyStepId { index });
            continue;
        }
        if !seen.insert(step.id.as_str()) {
            errors.push(ValidationError::DuplicateStepId {
                step_id: step.id.clone(),
            });
        }
        if step.operation_type.trim().is_empty() {
            errors.push(ValidationError::EmptyOperationType {
                step_id: step.id.clone(),
            });
        }
    }
}

/// Every key and value of the dependency map must name a declared step
fn validate_dependency_references(
    workflow: &WorkflowDefinition,
    errors: &mut Vec<ValidationError>,
) {
    let step_ids: HashSet<&str> = workflow.steps.iter().map(|s| s.id.as_str()).collect();

    // Sorted for stable error order
    let mut keys: Vec<&String> = workflow.dependencies.keys().collect();
    keys.sort();

    for step_id in keys {
        if !step_ids.contains(step_id.as_str()) {
            errors.push(ValidationError::UnknownDependent {
                step_id: step_id.clone(),
            });
        }
        for dependency in workflow.dependencies_of(step_id) {
            if dependency == step_id {
                errors.push(ValidationError::SelfDependency {
                    step_id: step_id.clone(),
                });
            } else if !step_ids.contains(dependency.as_str()) {
                errors.push(ValidationError::UnknownDependency {
                    step_id: step_id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }
}

/// Detect cycles using Kahn's algorithm (topological sort)
///
/// Self-edges and references to unknown steps are reported elsewhere and
/// skipped here.
fn detect_cycles(workflow: &WorkflowDefinition, errors: &mut Vec<ValidationError>) {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    for step in &workflow.steps {
        in_degree.insert(&step.id, 0);
    }

    let mut edges: Vec<(&str, &str)> = Vec::new();
    for step in &workflow.steps {
        for dependency in workflow.dependencies_of(&step.id) {
            if dependency != &step.id && in_degree.contains_key(dependency.as_str()) {
                edges.push((dependency.as_str(), step.id.as_str()));
            }
        }
    }
    for (_, target) in &edges {
        if let Some(deg) = in_degree.get_mut(target) {
            *deg += 1;
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&id, _)| id)
        .collect();

    let mut visited = HashSet::new();
    while let Some(step_id) = queue.pop_front() {
        visited.insert(step_id);
        for (source, target) in &edges {
            if *source == step_id {
                if let Some(deg) = in_degree.get_mut(target) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(*target);
                    }
                }
            }
        }
    }

    if visited.len() < in_degree.len() {
        let steps = workflow
            .steps
            .iter()
            .filter(|s| !visited.contains(s.id.as_str()))
            .map(|s| s.id.clone())
            .collect();
        errors.push(ValidationError::CycleDetected { steps });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Step;

    /// `deps` holds (step, dependency) edges
    fn workflow(steps: &[&str], deps: &[(&str, &str)]) -> WorkflowDefinition {
        let mut wf = WorkflowDefinition::new("wf", "Test");
        wf.steps = steps.iter().map(|id| Step::new(*id, "op")).collect();
        for (step, on) in deps {
            wf.dependencies
                .entry(step.to_string())
                .or_default()
                .push(on.to_string());
        }
        wf
    }

    #[test]
    fn test_valid_diamond() {
        let wf = workflow(
            &["a", "b", "c", "d"],
            &[("b", "a"), ("c", "a"), ("d", "b"), ("d", "c")],
        );
        assert!(validate_workflow(&wf).is_empty());
    }

    #[test]
    fn test_self_dependency() {
        let wf = workflow(&["s"], &[("s", "s")]);
        let errors = validate_workflow(&wf);
        assert_eq!(
            errors,
            vec![ValidationError::SelfDependency {
                step_id: "s".into()
            }]
        );
    }

    #[test]
    fn test_cycle_detected() {
        let wf = workflow(&["a", "b", "c"], &[("a", "c"), ("b", "a"), ("c", "b")]);
        let errors = validate_workflow(&wf);
        assert_eq!(errors.len(), 1);
        match &errors[0] {
            ValidationError::CycleDetected { steps } => assert_eq!(steps.len(), 3),
            other => panic!("Expected CycleDetected, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_references() {
        let wf = workflow(&["a"], &[("a", "ghost"), ("phantom", "a")]);
        let errors = validate_workflow(&wf);
        assert!(errors.contains(&ValidationError::UnknownDependency {
            step_id: "a".into(),
            dependency: "ghost".into()
        }));
        assert!(errors.contains(&ValidationError::UnknownDependent {
            step_id: "phantom".into()
        }));
    }

    #[test]
    fn test_collects_every_error() {
        let mut wf = workflow(&["a", "a", ""], &[]);
        wf.id = String::new();
        wf.max_concurrency = 0;
        wf.error_policy.failure_threshold = 1.5;
        wf.steps[0].operation_type = String::new();

        let errors = validate_workflow(&wf);
        assert!(errors.contains(&ValidationError::EmptyWorkflowId));
        assert!(errors.contains(&ValidationError::ZeroConcurrency));
        assert!(errors.contains(&ValidationError::FailureThresholdOutOfRange { value: 1.5 }));
        assert!(errors.contains(&ValidationError::DuplicateStepId {
            step_id: "a".into()
        }));
        assert!(errors.contains(&ValidationError::EmptyStepId { index: 2 }));
        assert!(errors.contains(&ValidationError::EmptyOperationType {
            step_id: "a".into()
        }));
    }

    #[test]
    fn test_workflow_id_must_be_a_plain_file_name() {
        for id in ["../escaped", "a/b", "a\\b", "..", ".hidden", "name with space"] {
            let mut wf = workflow(&["a"], &[]);
            wf.id = id.to_string();
            assert_eq!(
                validate_workflow(&wf),
                vec![ValidationError::UnsafeWorkflowId {
                    workflow_id: id.to_string()
                }],
                "id {:?}",
                id
            );
        }

        for id in ["etl", "nightly-report_v2", "build.1"] {
            let mut wf = workflow(&["a"], &[]);
            wf.id = id.to_string();
            assert!(validate_workflow(&wf).is_empty(), "id {:?}", id);
        }
    }

    #[test]
    fn test_no_steps() {
        let wf = WorkflowDefinition::new("wf", "Empty");
        assert_eq!(validate_workflow(&wf), vec![ValidationError::NoSteps]);
    }
}
