//! The value returned by every orchestration run

use std::collections::HashMap;

use crate::analyzer::{Analysis, PerformanceSummary};
use crate::context::{ExecutionContext, ExecutionState};
use crate::error::OrchestrationError;
use crate::executor::{ExecutionOutcome, StepResult};
use crate::optimization::OptimizationOutcome;
use crate::types::{StepId, WorkflowDefinition};

#[derive(Debug)]
pub struct ExecutionReport {
    /// Run completed and the failed-step ratio is within the threshold
    pub success: bool,
    /// The run's context, handed over to the caller
    pub context: ExecutionContext,
    pub results: HashMap<StepId, StepResult>,
    /// Terminal per-step failures
    pub errors: Vec<OrchestrationError>,
    /// Why the run did not complete, if it did not
    pub error: Option<OrchestrationError>,
    pub optimizations: Vec<OptimizationOutcome>,
    pub recommendations: Vec<String>,
    pub performance: PerformanceSummary,
}

impl ExecutionReport {
    pub(crate) fn new(
        context: ExecutionContext,
        workflow: &WorkflowDefinition,
        outcome: ExecutionOutcome,
        optimizations: Vec<OptimizationOutcome>,
        analysis: Analysis,
    ) -> Self {
        let failure_ratio = if workflow.steps.is_empty() {
            0.0
        } else {
            outcome.failures.len() as f64 / workflow.steps.len() as f64
        };
        let success = context.state() == ExecutionState::Completed
            && failure_ratio <= workflow.error_policy.failure_threshold;

        Self {
            success,
            context,
            results: outcome.results,
            errors: outcome.failures,
            error: outcome.error,
            optimizations,
            recommendations: analysis.recommendations,
            performance: analysis.summary,
        }
    }

    /// Report for a run that stopped before any step ran
    pub(crate) fn not_started(context: ExecutionContext, error: OrchestrationError) -> Self {
        let recommendation = match &error {
            OrchestrationError::NoProviderAvailable(step_id) => format!(
                "Step '{}' could not be allocated: no provider offers its operation and capabilities",
                step_id
            ),
            OrchestrationError::ConstraintUnsatisfiable(step_id) => format!(
                "Step '{}' could not be allocated: no provider meets its latency and reliability limits",
                step_id
            ),
            other => format!("Run did not start: {}", other),
        };

        Self {
            success: false,
            context,
            results: HashMap::new(),
            errors: Vec::new(),
            error: Some(error),
            optimizations: Vec::new(),
            recommendations: vec![recommendation],
            performance: PerformanceSummary::default(),
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.context.state()
    }

    /// Completed with at least one failed step
    pub fn is_degraded(&self) -> bool {
        self.state() == ExecutionState::Completed && !self.errors.is_empty()
    }

    pub fn output(&self, step_id: &str) -> Option<&serde_json::Value> {
        self.results.get(step_id).and_then(StepResult::output)
    }
}
