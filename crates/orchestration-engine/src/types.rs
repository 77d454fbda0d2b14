//! Core types for workflow definitions
//!
//! A workflow is a set of steps plus a dependency map. Definitions are pure
//! data: they are validated once at registration and never mutated after.

use std::collections::HashMap;

use provider_directory::{Parameters, ProviderMetadata};
use serde::{Deserialize, Serialize};

/// Unique identifier for a workflow
pub type WorkflowId = String;

/// Unique identifier for a step within a workflow
pub type StepId = String;

/// Unique identifier for a single orchestration run
pub type SessionId = String;

/// A registered unit of orchestration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<Step>,
    /// Step id to the ids it depends on
    #[serde(default)]
    pub dependencies: HashMap<StepId, Vec<StepId>>,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub error_policy: ErrorPolicy,
}

fn default_max_concurrency() -> usize {
    1
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            steps: Vec::new(),
            dependencies: HashMap::new(),
            max_concurrency: default_max_concurrency(),
            error_policy: ErrorPolicy::default(),
        }
    }

    /// Declared dependencies of a step, empty when it has none
    pub fn dependencies_of(&self, step_id: &str) -> &[StepId] {
        self.dependencies
            .get(step_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// One unit of work bound to a provider at run time
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: StepId,
    pub operation_type: String,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub requirements: Requirements,
    /// Carried in the model; scheduling uses declaration order
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

impl Step {
    pub fn new(id: impl Into<String>, operation_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            operation_type: operation_type.into(),
            parameters: Parameters::new(),
            requirements: Requirements::default(),
            priority: 0,
            timeout_ms: None,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// What a provider must offer to run a step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requirements {
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub performance: PerformanceRequirements,
}

impl Requirements {
    /// Capabilities and tools combined, duplicates removed, order kept
    pub fn required_capabilities(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for cap in self.capabilities.iter().chain(self.tools.iter()) {
            if !out.contains(cap) {
                out.push(cap.clone());
            }
        }
        out
    }
}

/// Performance bounds a provider must meet
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_reliability: Option<f64>,
    /// Checked after the run, not at allocation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_throughput: Option<f64>,
}

impl PerformanceRequirements {
    /// Whether advertised metadata meets the latency and reliability bounds
    pub fn satisfied_by(&self, metadata: &ProviderMetadata) -> bool {
        let latency_ok = self
            .max_latency_ms
            .map_or(true, |max| metadata.response_time_ms <= max);
        let reliability_ok = self
            .min_reliability
            .map_or(true, |min| metadata.reliability >= min);
        latency_ok && reliability_ok
    }
}

/// How a failed step is retried
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    /// Error kinds worth retrying; empty means every kind
    #[serde(default)]
    pub retryable_errors: Vec<String>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_strategy: BackoffStrategy) -> Self {
        Self {
            max_retries,
            backoff_strategy,
            retryable_errors: Vec::new(),
        }
    }

    pub fn is_retryable(&self, kind: &str) -> bool {
        self.retryable_errors.is_empty() || self.retryable_errors.iter().any(|k| k == kind)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackoffStrategy {
    Linear,
    #[default]
    Exponential,
}

/// Run-level failure handling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPolicy {
    /// Highest tolerated fraction of failed steps for a successful report
    #[serde(default)]
    pub failure_threshold: f64,
    #[serde(default)]
    pub fallback_strategy: FallbackStrategy,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 0.0,
            fallback_strategy: FallbackStrategy::Abort,
        }
    }
}

/// What happens after a step fails terminally
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FallbackStrategy {
    /// Stop the run; no further steps start
    #[default]
    Abort,
    /// Record a failure marker and keep going
    Continue,
    /// Same scheduling as Continue; the report counts as degraded
    Degraded,
}
