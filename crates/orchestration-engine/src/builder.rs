//! Fluent builder for workflow definitions
//!
//! Step-scoped methods (`with_parameter`, `depends_on`, `with_retry`, ...)
//! apply to the most recently added step.

use crate::error::{OrchestrationError, Result};
use crate::types::{
    BackoffStrategy, ErrorPolicy, FallbackStrategy, Requirements, RetryPolicy, Step,
    WorkflowDefinition,
};
use crate::validation::validate_workflow;

/// Fluent builder for constructing workflow definitions
///
/// # Example
///
/// ```ignore
/// let workflow = WorkflowBuilder::new("wf-1", "Render pipeline")
///     .step("fetch", "http.get")
///     .with_parameter("url", serde_json::json!("https://example.com"))
///     .step("render", "render.frame")
///     .depends_on(["fetch"])
///     .with_retry(2, BackoffStrategy::Exponential)
///     .max_concurrency(2)
///     .build_validated()?;
/// ```
pub struct WorkflowBuilder {
    workflow: WorkflowDefinition,
}

impl WorkflowBuilder {
    /// Create a new workflow builder
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            workflow: WorkflowDefinition::new(id, name),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.workflow.description = description.into();
        self
    }

    /// Add a step
    pub fn step(mut self, id: impl Into<String>, operation_type: impl Into<String>) -> Self {
        self.workflow.steps.push(Step::new(id, operation_type));
        self
    }

    /// Set a parameter on the most recently added step
    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        if let Some(step) = self.workflow.steps.last_mut() {
            step.parameters.insert(key.into(), value);
        }
        self
    }

    /// Declare dependencies of the most recently added step
    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(step) = self.workflow.steps.last() {
            self.workflow
                .dependencies
                .entry(step.id.clone())
                .or_default()
                .extend(dependencies.into_iter().map(Into::into));
        }
        self
    }

    pub fn with_requirements(mut self, requirements: Requirements) -> Self {
        if let Some(step) = self.workflow.steps.last_mut() {
            step.requirements = requirements;
        }
        self
    }

    /// Require a capability on the most recently added step
    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        if let Some(step) = self.workflow.steps.last_mut() {
            step.requirements.capabilities.push(capability.into());
        }
        self
    }

    pub fn with_retry(mut self, max_retries: u32, backoff_strategy: BackoffStrategy) -> Self {
        if let Some(step) = self.workflow.steps.last_mut() {
            step.retry_policy = RetryPolicy {
                max_retries,
                backoff_strategy,
                retryable_errors: std::mem::take(&mut step.retry_policy.retryable_errors),
            };
        }
        self
    }

    /// Restrict retries of the most recently added step to these error kinds
    pub fn retry_on<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(step) = self.workflow.steps.last_mut() {
            step.retry_policy
                .retryable_errors
                .extend(kinds.into_iter().map(Into::into));
        }
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        if let Some(step) = self.workflow.steps.last_mut() {
            step.timeout_ms = Some(timeout_ms);
        }
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        if let Some(step) = self.workflow.steps.last_mut() {
            step.priority = priority;
        }
        self
    }

    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.workflow.max_concurrency = max_concurrency;
        self
    }

    pub fn error_policy(mut self, failure_threshold: f64, fallback_strategy: FallbackStrategy) -> Self {
        self.workflow.error_policy = ErrorPolicy {
            failure_threshold,
            fallback_strategy,
        };
        self
    }

    /// Build the definition without validation
    pub fn build(self) -> WorkflowDefinition {
        self.workflow
    }

    /// Build and validate the definition
    pub fn build_validated(self) -> Result<WorkflowDefinition> {
        let errors = validate_workflow(&self.workflow);
        if errors.is_empty() {
            Ok(self.workflow)
        } else {
            Err(OrchestrationError::invalid(
                self.workflow.id,
                errors.iter().map(ToString::to_string).collect(),
            ))
        }
    }
}
