//! Dependency-ordered batch execution
//!
//! The executor repeatedly collects the ready set (steps whose dependencies
//! have all settled), runs up to `max_concurrency` of them concurrently and
//! waits for the whole batch before computing the next one.
//!
//! Each step receives its own parameters overlaid with optimization
//! overrides, plus two injected keys:
//!
//! - `_dependencies`: dependency id to its output, or a failure marker
//! - `_run`: the caller's run parameters

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use provider_directory::{Parameters, ProviderError, ProviderId};
use serde::{Deserialize, Serialize};

use crate::context::{ExecutionContext, ExecutionState};
use crate::error::OrchestrationError;
use crate::events::{EventSink, OrchestrationEvent};
use crate::retry::RetryController;
use crate::types::{FallbackStrategy, Step, StepId, WorkflowDefinition};

/// Key under which dependency outputs are passed to a step
pub const DEPENDENCIES_KEY: &str = "_dependencies";
/// Key under which run parameters are passed to a step
pub const RUN_PARAMETERS_KEY: &str = "_run";
/// Override key a strategy may set to bound steps without a declared timeout
pub const TIMEOUT_HINT_KEY: &str = "_timeoutHintMs";

/// Settled outcome of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum StepResult {
    Success { output: serde_json::Value },
    /// Failure marker recorded under Continue or Degraded
    Failed { error: String, kind: String },
}

impl StepResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn output(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Success { output } => Some(output),
            Self::Failed { .. } => None,
        }
    }

    /// Value handed to dependents
    pub fn to_dependency_value(&self) -> serde_json::Value {
        match self {
            Self::Success { output } => output.clone(),
            Self::Failed { error, kind } => serde_json::json!({
                "failed": true,
                "error": error,
                "kind": kind,
            }),
        }
    }
}

/// Everything the executor produced for a run
#[derive(Debug, Default)]
pub struct ExecutionOutcome {
    pub results: HashMap<StepId, StepResult>,
    /// One `StepExecution` error per terminally failed step
    pub failures: Vec<OrchestrationError>,
    /// Run-level error, if the run did not complete
    pub error: Option<OrchestrationError>,
}

struct SettledStep {
    step_id: StepId,
    provider_id: Option<ProviderId>,
    duration_ms: u64,
    attempts: u32,
    result: Result<serde_json::Value, ProviderError>,
}

struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct DagExecutor {
    retry: RetryController,
    default_timeout: Option<Duration>,
}

impl DagExecutor {
    pub fn new(retry: RetryController) -> Self {
        Self {
            retry,
            default_timeout: None,
        }
    }

    /// Per-attempt timeout for steps that declare none
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Run the workflow against the context's allocation
    ///
    /// Leaves the context in `Completed`, `Failed` or `Cancelled`.
    pub async fn execute(
        &self,
        context: &mut ExecutionContext,
        workflow: &WorkflowDefinition,
        events: &dyn EventSink,
    ) -> ExecutionOutcome {
        if context.transition(ExecutionState::Running) {
            context.execution_log.info(
                None,
                format!("Executing {} step(s)", workflow.steps.len()),
            );
        } else {
            log::warn!(
                "Session {} entered execution in state {:?}",
                context.session_id,
                context.state()
            );
        }

        let max_concurrency = workflow.max_concurrency.max(1);
        let in_flight = InFlight {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        };
        let mut outcome = ExecutionOutcome::default();

        loop {
            if context.is_cancelled() {
                context
                    .execution_log
                    .warn(None, "Cancellation requested, no further batches start");
                context.transition(ExecutionState::Cancelled);
                outcome.error = Some(OrchestrationError::Cancelled);
                break;
            }

            let pending: Vec<&Step> = workflow
                .steps
                .iter()
                .filter(|s| !outcome.results.contains_key(&s.id))
                .collect();
            if pending.is_empty() {
                context.transition(ExecutionState::Completed);
                break;
            }

            let ready: Vec<&Step> = pending
                .iter()
                .copied()
                .filter(|s| {
                    workflow
                        .dependencies_of(&s.id)
                        .iter()
                        .all(|d| outcome.results.contains_key(d))
                })
                .take(max_concurrency)
                .collect();

            if ready.is_empty() {
                let pending: Vec<String> = pending.iter().map(|s| s.id.clone()).collect();
                context.execution_log.error(
                    None,
                    format!("No step is ready; unresolved: {}", pending.join(", ")),
                );
                context.transition(ExecutionState::Failed);
                outcome.error = Some(OrchestrationError::CircularOrUnresolvedDependency { pending });
                break;
            }

            context.performance.batches += 1;
            log::debug!(
                "Session {} batch {}: {:?}",
                context.session_id,
                context.performance.batches,
                ready.iter().map(|s| s.id.as_str()).collect::<Vec<_>>()
            );

            let settled = {
                let ctx: &ExecutionContext = context;
                let results = &outcome.results;
                let in_flight = &in_flight;
                join_all(
                    ready
                        .iter()
                        .map(|step| self.run_step(ctx, workflow, step, results, in_flight, events)),
                )
                .await
            };

            if let Some(error) = self.integrate(context, workflow, settled, &mut outcome, events) {
                context.transition(ExecutionState::Failed);
                outcome.error = Some(error);
                break;
            }
        }

        context.performance.peak_concurrency = in_flight.peak.load(Ordering::SeqCst);
        outcome
    }

    /// Record a batch's results; returns the abort error when the run must stop
    fn integrate(
        &self,
        context: &mut ExecutionContext,
        workflow: &WorkflowDefinition,
        settled: Vec<SettledStep>,
        outcome: &mut ExecutionOutcome,
        events: &dyn EventSink,
    ) -> Option<OrchestrationError> {
        let mut abort = None;

        for step in settled {
            context
                .performance
                .step_durations_ms
                .insert(step.step_id.clone(), step.duration_ms);
            if let Some(provider_id) = &step.provider_id {
                *context
                    .performance
                    .provider_utilization_ms
                    .entry(provider_id.clone())
                    .or_default() += step.duration_ms;
            }

            match step.result {
                Ok(output) => {
                    emit(
                        events,
                        OrchestrationEvent::StepCompleted {
                            session_id: context.session_id.clone(),
                            step_id: step.step_id.clone(),
                            duration_ms: step.duration_ms,
                        },
                    );
                    outcome
                        .results
                        .insert(step.step_id, StepResult::Success { output });
                }
                Err(error) => {
                    context.execution_log.error(
                        Some(&step.step_id),
                        format!("Failed after {} attempt(s): {}", step.attempts, error),
                    );
                    emit(
                        events,
                        OrchestrationEvent::StepFailed {
                            session_id: context.session_id.clone(),
                            step_id: step.step_id.clone(),
                            attempts: step.attempts,
                            error: error.to_string(),
                        },
                    );

                    match workflow.error_policy.fallback_strategy {
                        FallbackStrategy::Abort => {
                            if abort.is_none() {
                                abort = Some(OrchestrationError::OrchestrationAborted {
                                    step_id: step.step_id.clone(),
                                    reason: error.to_string(),
                                });
                            }
                        }
                        FallbackStrategy::Continue | FallbackStrategy::Degraded => {
                            outcome.results.insert(
                                step.step_id.clone(),
                                StepResult::Failed {
                                    error: error.to_string(),
                                    kind: error.kind().to_string(),
                                },
                            );
                        }
                    }

                    outcome.failures.push(OrchestrationError::StepExecution {
                        step_id: step.step_id,
                        attempts: step.attempts,
                        source: error,
                    });
                }
            }
        }

        abort
    }

    async fn run_step(
        &self,
        context: &ExecutionContext,
        workflow: &WorkflowDefinition,
        step: &Step,
        results: &HashMap<StepId, StepResult>,
        in_flight: &InFlight,
        events: &dyn EventSink,
    ) -> SettledStep {
        let started = Instant::now();

        let Some(handle) = context.provider_allocation.get(&step.id) else {
            return SettledStep {
                step_id: step.id.clone(),
                provider_id: None,
                duration_ms: 0,
                attempts: 0,
                result: Err(ProviderError::Unavailable(format!(
                    "no provider allocated for step '{}'",
                    step.id
                ))),
            };
        };

        let overrides = context.step_overrides.get(&step.id);
        let parameters = step_parameters(context, workflow, step, overrides, results);
        let timeout = step
            .timeout_ms
            .or_else(|| overrides.and_then(|o| o.get(TIMEOUT_HINT_KEY)).and_then(|v| v.as_u64()))
            .map(Duration::from_millis)
            .or(self.default_timeout);

        emit(
            events,
            OrchestrationEvent::StepStarted {
                session_id: context.session_id.clone(),
                step_id: step.id.clone(),
                provider_id: handle.id.clone(),
            },
        );
        in_flight.enter();

        let outcome = self
            .retry
            .run_with_retry_observed(
                step,
                |_| {
                    let provider = Arc::clone(&handle.provider);
                    let operation = step.operation_type.clone();
                    let parameters = parameters.clone();
                    async move {
                        let call = provider.execute(&operation, parameters);
                        match timeout {
                            Some(limit) => match tokio::time::timeout(limit, call).await {
                                Ok(result) => result,
                                Err(_) => Err(ProviderError::Timeout(format!(
                                    "'{}' exceeded {} ms",
                                    operation,
                                    limit.as_millis()
                                ))),
                            },
                            None => call.await,
                        }
                    }
                },
                |attempt, error, delay| {
                    context.execution_log.warn(
                        Some(&step.id),
                        format!(
                            "Attempt {} failed ({}), retrying in {} ms",
                            attempt,
                            error,
                            delay.as_millis()
                        ),
                    );
                    emit(
                        events,
                        OrchestrationEvent::StepRetrying {
                            session_id: context.session_id.clone(),
                            step_id: step.id.clone(),
                            attempt,
                            delay_ms: delay.as_millis() as u64,
                            error: error.to_string(),
                        },
                    );
                },
            )
            .await;

        in_flight.exit();

        SettledStep {
            step_id: step.id.clone(),
            provider_id: Some(handle.id.clone()),
            duration_ms: started.elapsed().as_millis() as u64,
            attempts: outcome.attempts,
            result: outcome.result,
        }
    }
}

fn step_parameters(
    context: &ExecutionContext,
    workflow: &WorkflowDefinition,
    step: &Step,
    overrides: Option<&Parameters>,
    results: &HashMap<StepId, StepResult>,
) -> Parameters {
    let mut parameters = step.parameters.clone();
    if let Some(overrides) = overrides {
        parameters.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    let dependencies: serde_json::Map<String, serde_json::Value> = workflow
        .dependencies_of(&step.id)
        .iter()
        .filter_map(|d| results.get(d).map(|r| (d.clone(), r.to_dependency_value())))
        .collect();
    parameters.insert(
        DEPENDENCIES_KEY.to_string(),
        serde_json::Value::Object(dependencies),
    );

    let run: serde_json::Map<String, serde_json::Value> = context
        .parameters
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    parameters.insert(RUN_PARAMETERS_KEY.to_string(), serde_json::Value::Object(run));

    parameters
}

fn emit(events: &dyn EventSink, event: OrchestrationEvent) {
    if let Err(e) = events.send(event) {
        log::warn!("Failed to send orchestration event: {}", e);
    }
}
