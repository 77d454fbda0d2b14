//! Post-execution analysis and the rolling performance history
//!
//! After every run the analyzer finalizes the context's performance record,
//! appends a `RunRecord` to the workflow's history and derives
//! recommendations. The history is the only state shared between runs.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use provider_directory::ProviderId;
use serde::{Deserialize, Serialize};

use crate::config::OrchestratorConfig;
use crate::context::{ExecutionContext, ExecutionState};
use crate::executor::ExecutionOutcome;
use crate::types::{SessionId, StepId, WorkflowDefinition, WorkflowId};

/// Summary of one finished run kept in the history
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub session_id: SessionId,
    pub recorded_at: DateTime<Utc>,
    pub state: ExecutionState,
    pub total_duration_ms: u64,
    pub throughput: f64,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub step_durations_ms: HashMap<StepId, u64>,
    pub step_providers: HashMap<StepId, ProviderId>,
}

impl RunRecord {
    /// Mean duration of the steps each provider ran in this record
    pub fn provider_latency_ms(&self) -> HashMap<ProviderId, f64> {
        let mut totals: HashMap<ProviderId, (u64, u64)> = HashMap::new();
        for (step_id, provider_id) in &self.step_providers {
            if let Some(duration) = self.step_durations_ms.get(step_id) {
                let entry = totals.entry(provider_id.clone()).or_default();
                entry.0 += duration;
                entry.1 += 1;
            }
        }
        totals
            .into_iter()
            .map(|(id, (sum, n))| (id, sum as f64 / n as f64))
            .collect()
    }
}

/// Mean observed step latency of a provider across records
pub fn observed_provider_latency(history: &[RunRecord], provider_id: &str) -> Option<f64> {
    let samples: Vec<f64> = history
        .iter()
        .filter_map(|r| r.provider_latency_ms().get(provider_id).copied())
        .collect();
    mean(&samples)
}

/// Mean observed duration of a step across records
pub fn observed_step_duration(history: &[RunRecord], step_id: &str) -> Option<f64> {
    let samples: Vec<f64> = history
        .iter()
        .filter_map(|r| r.step_durations_ms.get(step_id).map(|d| *d as f64))
        .collect();
    mean(&samples)
}

fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        None
    } else {
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }
}

/// Bounded per-workflow ring buffer of run records
#[derive(Debug)]
pub struct PerformanceHistory {
    capacity: usize,
    runs: Mutex<HashMap<WorkflowId, VecDeque<RunRecord>>>,
}

impl PerformanceHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Append a record, evicting the oldest when full
    pub fn record(&self, workflow_id: &str, record: RunRecord) {
        if self.capacity == 0 {
            return;
        }
        let mut runs = self.runs.lock();
        let entries = runs.entry(workflow_id.to_string()).or_default();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(record);
    }

    /// Records for a workflow, oldest first
    pub fn snapshot(&self, workflow_id: &str) -> Vec<RunRecord> {
        self.runs
            .lock()
            .get(workflow_id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, workflow_id: &str) -> usize {
        self.runs.lock().get(workflow_id).map_or(0, VecDeque::len)
    }

    pub fn mean_duration_ms(&self, workflow_id: &str) -> Option<f64> {
        let durations: Vec<f64> = self
            .runs
            .lock()
            .get(workflow_id)?
            .iter()
            .map(|r| r.total_duration_ms as f64)
            .collect();
        mean(&durations)
    }
}

/// Derived figures describing a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSummary {
    /// Busy step time over available slot time, 0.0..=1.0
    pub efficiency: f64,
    /// Relative improvement over the workflow's historical mean duration
    pub optimization: f64,
    /// Successful steps over settled steps
    pub reliability: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Analysis {
    pub recommendations: Vec<String>,
    pub summary: PerformanceSummary,
}

pub struct PerformanceAnalyzer {
    slow_step_threshold_ms: u64,
    min_throughput_per_sec: f64,
}

impl Default for PerformanceAnalyzer {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

impl PerformanceAnalyzer {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            slow_step_threshold_ms: config.slow_step_threshold_ms,
            min_throughput_per_sec: config.min_throughput_per_sec,
        }
    }

    /// Finalize the context's figures, record the run and recommend
    pub fn analyze(
        &self,
        context: &mut ExecutionContext,
        workflow: &WorkflowDefinition,
        outcome: &ExecutionOutcome,
        history: &PerformanceHistory,
    ) -> Analysis {
        let total_ms = context.elapsed_ms();
        let completed = outcome.results.values().filter(|r| r.is_success()).count();
        let failed = outcome.failures.len();
        let throughput = completed as f64 / (total_ms.max(1) as f64 / 1000.0);

        context.performance.total_duration_ms = total_ms;
        context.performance.throughput = throughput;

        let prior_mean = history.mean_duration_ms(&workflow.id);
        let summary = summarize(context, workflow, completed, failed, prior_mean);
        let recommendations = self.recommend(context, workflow, outcome);

        history.record(
            &workflow.id,
            RunRecord {
                session_id: context.session_id.clone(),
                recorded_at: Utc::now(),
                state: context.state(),
                total_duration_ms: total_ms,
                throughput,
                completed_steps: completed,
                failed_steps: failed,
                step_durations_ms: context.performance.step_durations_ms.clone(),
                step_providers: context
                    .provider_allocation
                    .iter()
                    .map(|(step, handle)| (step.clone(), handle.id.clone()))
                    .collect(),
            },
        );

        context.execution_log.info(
            None,
            format!(
                "Run finished in {} ms: {} completed, {} failed, {:.2} steps/sec",
                total_ms, completed, failed, throughput
            ),
        );

        Analysis {
            recommendations,
            summary,
        }
    }

    fn recommend(
        &self,
        context: &ExecutionContext,
        workflow: &WorkflowDefinition,
        outcome: &ExecutionOutcome,
    ) -> Vec<String> {
        let mut recommendations = Vec::new();
        let perf = &context.performance;

        let durations: Vec<f64> = perf.step_durations_ms.values().map(|d| *d as f64).collect();
        if let Some(average) = mean(&durations) {
            if average > self.slow_step_threshold_ms as f64 {
                recommendations.push(format!(
                    "Average step duration {:.0} ms exceeds {} ms: consider parallelization",
                    average, self.slow_step_threshold_ms
                ));
            }
            if perf.throughput < self.min_throughput_per_sec {
                recommendations.push(format!(
                    "Throughput {:.2} steps/sec is below {:.2}: review dependencies",
                    perf.throughput, self.min_throughput_per_sec
                ));
            }
        }

        for failure in &outcome.failures {
            recommendations.push(format!("{}: review its retry policy or provider", failure));
        }

        for step_id in context.flagged_allocations() {
            recommendations.push(format!(
                "Step '{}' is bound to an unhealthy or removed provider: reallocate before the next run",
                step_id
            ));
        }

        for step in &workflow.steps {
            let (Some(min), Some(duration)) = (
                step.requirements.performance.min_throughput,
                perf.step_durations_ms.get(&step.id),
            ) else {
                continue;
            };
            let observed = 1000.0 / (*duration).max(1) as f64;
            if observed < min {
                recommendations.push(format!(
                    "Step '{}' ran at {:.2} ops/sec, below its declared minimum {:.2}",
                    step.id, observed, min
                ));
            }
        }

        recommendations
    }
}

fn summarize(
    context: &ExecutionContext,
    workflow: &WorkflowDefinition,
    completed: usize,
    failed: usize,
    prior_mean: Option<f64>,
) -> PerformanceSummary {
    let perf = &context.performance;

    let busy: u64 = perf.step_durations_ms.values().sum();
    let capacity = perf.total_duration_ms.max(1) as f64 * workflow.max_concurrency.max(1) as f64;
    let efficiency = (busy as f64 / capacity).clamp(0.0, 1.0);

    let settled = completed + failed;
    let reliability = if settled == 0 {
        0.0
    } else {
        completed as f64 / settled as f64
    };

    let optimization = match prior_mean {
        Some(mean) if mean > 0.0 => (mean - perf.total_duration_ms as f64) / mean,
        _ => 0.0,
    };

    PerformanceSummary {
        efficiency,
        optimization,
        reliability,
    }
}
