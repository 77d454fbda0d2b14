//! Pre-execution optimization strategies
//!
//! Strategies run in order between allocation and execution. They may swap
//! providers and write parameter overrides, nothing else: the workflow,
//! directory and history are only lent out read-only. A strategy that
//! fails is rolled back and skipped.

use std::collections::HashMap;

use provider_directory::{CapabilityDirectory, Parameters, ProviderHandle};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::allocator::qualifying_providers;
use crate::analyzer::{observed_provider_latency, observed_step_duration, RunRecord};
use crate::context::ExecutionContext;
use crate::events::{EventSink, OrchestrationEvent};
use crate::executor::TIMEOUT_HINT_KEY;
use crate::types::{StepId, WorkflowDefinition};

#[derive(Debug, Clone, Error)]
pub enum OptimizationError {
    /// A step has no provider in the allocation
    #[error("Step '{0}' has no allocated provider")]
    MissingAllocation(String),

    /// The dependency graph cannot be ordered
    #[error("Dependency graph is not acyclic")]
    CyclicGraph,

    #[error("{0}")]
    Failed(String),
}

/// What a strategy changed, with its before/after metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationOutcome {
    pub strategy: String,
    pub applied: bool,
    pub before: f64,
    pub after: f64,
    pub modifications: Vec<String>,
}

impl OptimizationOutcome {
    fn new(strategy: &str, before: f64, after: f64, modifications: Vec<String>) -> Self {
        Self {
            strategy: strategy.to_string(),
            applied: !modifications.is_empty(),
            before,
            after,
            modifications,
        }
    }
}

/// The slice of a run a strategy may see and change
pub struct OptimizationInput<'a> {
    pub workflow: &'a WorkflowDefinition,
    pub directory: &'a dyn CapabilityDirectory,
    pub history: &'a [RunRecord],
    pub allocation: &'a mut HashMap<StepId, ProviderHandle>,
    pub overrides: &'a mut HashMap<StepId, Parameters>,
}

impl OptimizationInput<'_> {
    fn provider(&self, step_id: &str) -> Result<&ProviderHandle, OptimizationError> {
        self.allocation
            .get(step_id)
            .ok_or_else(|| OptimizationError::MissingAllocation(step_id.to_string()))
    }

    /// Observed mean latency when history has it, else the advertised one
    fn expected_latency(&self, handle: &ProviderHandle) -> f64 {
        observed_provider_latency(self.history, &handle.id)
            .unwrap_or(handle.metadata.response_time_ms as f64)
    }
}

pub trait OptimizationStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, input: &mut OptimizationInput<'_>) -> Result<OptimizationOutcome, OptimizationError>;
}

/// Ordered collection of strategies
#[derive(Default)]
pub struct StrategySet {
    strategies: Vec<Box<dyn OptimizationStrategy>>,
}

impl StrategySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latency rebalance and load spread
    ///
    /// `TimeoutHint` is opt-in: it enforces a deadline the workflow never
    /// declared.
    pub fn with_defaults(max_steps_per_provider: usize) -> Self {
        Self::new()
            .with(LatencyRebalance)
            .with(LoadSpread::new(max_steps_per_provider))
    }

    pub fn with(mut self, strategy: impl OptimizationStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Apply every strategy in order
    ///
    /// A failing strategy leaves the allocation and overrides exactly as it
    /// found them.
    pub fn run(
        &self,
        context: &mut ExecutionContext,
        workflow: &WorkflowDefinition,
        directory: &dyn CapabilityDirectory,
        history: &[RunRecord],
        events: &dyn EventSink,
    ) -> Vec<OptimizationOutcome> {
        let mut outcomes = Vec::new();

        for strategy in &self.strategies {
            let allocation_snapshot = context.provider_allocation.clone();
            let overrides_snapshot = context.step_overrides.clone();

            let result = {
                let mut input = OptimizationInput {
                    workflow,
                    directory,
                    history,
                    allocation: &mut context.provider_allocation,
                    overrides: &mut context.step_overrides,
                };
                strategy.apply(&mut input)
            };

            let event = match result {
                Ok(outcome) => {
                    if outcome.applied {
                        context.execution_log.info(
                            None,
                            format!(
                                "Strategy '{}' applied {} change(s): {:.2} -> {:.2}",
                                outcome.strategy,
                                outcome.modifications.len(),
                                outcome.before,
                                outcome.after
                            ),
                        );
                    }
                    let event = OrchestrationEvent::StrategyApplied {
                        session_id: context.session_id.clone(),
                        strategy: outcome.strategy.clone(),
                        modifications: outcome.modifications.len(),
                    };
                    outcomes.push(outcome);
                    event
                }
                Err(error) => {
                    context.provider_allocation = allocation_snapshot;
                    context.step_overrides = overrides_snapshot;
                    context.execution_log.warn(
                        None,
                        format!("Strategy '{}' skipped: {}", strategy.name(), error),
                    );
                    OrchestrationEvent::StrategySkipped {
                        session_id: context.session_id.clone(),
                        strategy: strategy.name().to_string(),
                        reason: error.to_string(),
                    }
                }
            };

            if let Err(e) = events.send(event) {
                log::warn!("Failed to send orchestration event: {}", e);
            }
        }

        outcomes
    }
}

/// Longest path through the dependency graph, weighting each step
fn critical_path<F>(workflow: &WorkflowDefinition, weight: F) -> Result<f64, OptimizationError>
where
    F: Fn(&str) -> Result<f64, OptimizationError>,
{
    let mut finish: HashMap<&str, f64> = HashMap::new();

    while finish.len() < workflow.steps.len() {
        let before = finish.len();
        for step in &workflow.steps {
            if finish.contains_key(step.id.as_str()) {
                continue;
            }
            let deps = workflow.dependencies_of(&step.id);
            if !deps.iter().all(|d| finish.contains_key(d.as_str())) {
                continue;
            }
            let start = deps
                .iter()
                .filter_map(|d| finish.get(d.as_str()))
                .fold(0.0_f64, |acc, f| acc.max(*f));
            finish.insert(&step.id, start + weight(&step.id)?);
        }
        if finish.len() == before {
            return Err(OptimizationError::CyclicGraph);
        }
    }

    Ok(finish.values().fold(0.0, |acc, f| acc.max(*f)))
}

/// Move steps to qualifying providers with lower expected latency
///
/// Metric: projected critical-path latency in milliseconds.
pub struct LatencyRebalance;

impl LatencyRebalance {
    fn projected(input: &OptimizationInput<'_>) -> Result<f64, OptimizationError> {
        critical_path(input.workflow, |step_id| {
            input.provider(step_id).map(|h| input.expected_latency(h))
        })
    }
}

impl OptimizationStrategy for LatencyRebalance {
    fn name(&self) -> &str {
        "latency_rebalance"
    }

    fn apply(&self, input: &mut OptimizationInput<'_>) -> Result<OptimizationOutcome, OptimizationError> {
        let workflow = input.workflow;
        let before = Self::projected(input)?;
        let mut modifications = Vec::new();

        for step in &workflow.steps {
            let current = input.provider(&step.id)?;
            let current_latency = input.expected_latency(current);

            let faster = qualifying_providers(input.directory, step)
                .into_iter()
                .map(|h| (input.expected_latency(&h), h))
                .filter(|(latency, h)| *latency < current_latency && h.id != current.id)
                .min_by(|a, b| a.0.total_cmp(&b.0));

            if let Some((latency, handle)) = faster {
                modifications.push(format!(
                    "{}: {} ({:.0} ms) -> {} ({:.0} ms)",
                    step.id, current.id, current_latency, handle.id, latency
                ));
                input.allocation.insert(step.id.clone(), handle);
            }
        }

        let after = Self::projected(input)?;
        Ok(OptimizationOutcome::new(self.name(), before, after, modifications))
    }
}

/// Cap how many steps of one run share a provider
///
/// Metric: most steps bound to a single provider.
pub struct LoadSpread {
    max_steps_per_provider: usize,
}

impl LoadSpread {
    pub fn new(max_steps_per_provider: usize) -> Self {
        Self {
            max_steps_per_provider: max_steps_per_provider.max(1),
        }
    }

    fn load(allocation: &HashMap<StepId, ProviderHandle>) -> HashMap<String, usize> {
        let mut load: HashMap<String, usize> = HashMap::new();
        for handle in allocation.values() {
            *load.entry(handle.id.clone()).or_default() += 1;
        }
        load
    }
}

impl OptimizationStrategy for LoadSpread {
    fn name(&self) -> &str {
        "load_spread"
    }

    fn apply(&self, input: &mut OptimizationInput<'_>) -> Result<OptimizationOutcome, OptimizationError> {
        let mut load = Self::load(input.allocation);
        let before = load.values().copied().max().unwrap_or(0) as f64;
        let mut modifications = Vec::new();

        let workflow = input.workflow;
        for step in &workflow.steps {
            let current_id = input.provider(&step.id)?.id.clone();
            if load.get(&current_id).copied().unwrap_or(0) <= self.max_steps_per_provider {
                continue;
            }

            // Least loaded qualifying alternate, directory order breaks ties
            let target = qualifying_providers(input.directory, step)
                .into_iter()
                .filter(|h| h.id != current_id)
                .map(|h| (load.get(&h.id).copied().unwrap_or(0), h))
                .filter(|(count, _)| *count < self.max_steps_per_provider)
                .min_by_key(|(count, _)| *count);

            if let Some((_, handle)) = target {
                if let Some(count) = load.get_mut(&current_id) {
                    *count -= 1;
                }
                *load.entry(handle.id.clone()).or_default() += 1;
                modifications.push(format!("{}: {} -> {}", step.id, current_id, handle.id));
                input.allocation.insert(step.id.clone(), handle);
            }
        }

        let after = load.values().copied().max().unwrap_or(0) as f64;
        Ok(OptimizationOutcome::new(self.name(), before, after, modifications))
    }
}

/// Bound steps without a declared timeout by their observed duration
///
/// Writes `_timeoutHintMs` into the step's overrides, which the executor
/// uses as the per-attempt timeout. Metric: number of unbounded steps.
pub struct TimeoutHint {
    pub multiplier: f64,
    pub floor_ms: u64,
}

impl Default for TimeoutHint {
    fn default() -> Self {
        Self {
            multiplier: 3.0,
            floor_ms: 1000,
        }
    }
}

impl OptimizationStrategy for TimeoutHint {
    fn name(&self) -> &str {
        "timeout_hint"
    }

    fn apply(&self, input: &mut OptimizationInput<'_>) -> Result<OptimizationOutcome, OptimizationError> {
        if !(self.multiplier.is_finite() && self.multiplier > 0.0) {
            return Err(OptimizationError::Failed(format!(
                "multiplier {} must be positive",
                self.multiplier
            )));
        }

        let workflow = input.workflow;
        let unbounded: Vec<&str> = workflow
            .steps
            .iter()
            .filter(|s| s.timeout_ms.is_none())
            .filter(|s| {
                input
                    .overrides
                    .get(&s.id)
                    .map_or(true, |o| !o.contains_key(TIMEOUT_HINT_KEY))
            })
            .map(|s| s.id.as_str())
            .collect();
        let before = unbounded.len() as f64;
        let mut modifications = Vec::new();

        for step_id in unbounded {
            let Some(observed) = observed_step_duration(input.history, step_id) else {
                continue;
            };
            let hint = ((observed * self.multiplier).ceil() as u64).max(self.floor_ms);
            input
                .overrides
                .entry(step_id.to_string())
                .or_default()
                .insert(TIMEOUT_HINT_KEY.to_string(), serde_json::json!(hint));
            modifications.push(format!("{}: timeout hint {} ms", step_id, hint));
        }

        let after = before - modifications.len() as f64;
        Ok(OptimizationOutcome::new(self.name(), before, after, modifications))
    }
}
