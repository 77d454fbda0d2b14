//! Orchestration Engine - dependency-ordered workflow execution over providers
//!
//! Workflows are DAGs of steps. Each step names an operation and the
//! capabilities a provider must advertise to run it. The engine:
//!
//! - Validates and registers workflow definitions (optionally persisted)
//! - Allocates one provider per step from a `CapabilityDirectory`
//! - Applies optimization strategies to the allocation before a run
//! - Executes steps in dependency-ordered batches with bounded concurrency,
//!   per-step timeouts and retries with backoff
//! - Analyzes each run and keeps a bounded performance history
//!
//! # Architecture
//!
//! - `Orchestrator`: facade that ties the pipeline together per run
//! - `Allocator`: all-or-nothing provider selection
//! - `StrategySet`: ordered, rollback-on-failure allocation rewrites
//! - `DagExecutor`: batch scheduler and fallback handling
//! - `PerformanceAnalyzer`: recommendations and summary metrics
//! - `EventSink`: generic event streaming for run progress
//!
//! # Example
//!
//! ```ignore
//! use orchestration_engine::{Orchestrator, WorkflowBuilder};
//! use provider_directory::{InMemoryDirectory, Parameters};
//!
//! let orchestrator = Orchestrator::new(Arc::new(InMemoryDirectory::new()));
//! orchestrator.register_workflow(
//!     WorkflowBuilder::new("etl", "Extract and load")
//!         .step("extract", "fetch")
//!         .step("load", "store")
//!         .depends_on(["extract"])
//!         .build(),
//! )?;
//! let report = orchestrator.orchestrate("etl", Parameters::new()).await?;
//! ```

pub mod allocator;
pub mod analyzer;
pub mod builder;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod optimization;
pub mod orchestrator;
pub mod registry;
pub mod report;
pub mod retry;
pub mod types;
pub mod validation;

// Re-export key types
pub use allocator::Allocator;
pub use analyzer::{PerformanceAnalyzer, PerformanceHistory, PerformanceSummary, RunRecord};
pub use builder::WorkflowBuilder;
pub use config::{ConfigError, OrchestratorConfig};
pub use context::{CancelHandle, ExecutionContext, ExecutionLog, ExecutionState, LogLevel};
pub use error::{OrchestrationError, Result};
pub use events::{EventSink, NullEventSink, OrchestrationEvent, VecEventSink};
pub use executor::{DagExecutor, ExecutionOutcome, StepResult};
pub use optimization::{
    LatencyRebalance, LoadSpread, OptimizationOutcome, OptimizationStrategy, StrategySet,
    TimeoutHint,
};
pub use orchestrator::Orchestrator;
pub use registry::{WorkflowRegistry, WorkflowSummary};
pub use report::ExecutionReport;
pub use retry::RetryController;
pub use types::{
    BackoffStrategy, ErrorPolicy, FallbackStrategy, PerformanceRequirements, Requirements,
    RetryPolicy, SessionId, Step, StepId, WorkflowDefinition, WorkflowId,
};
pub use validation::{validate_workflow, ValidationError};

// Re-export directory types that consumers will need
pub use provider_directory::{
    CapabilityDirectory, DirectoryEvent, InMemoryDirectory, Parameters, Provider, ProviderError,
    ProviderHandle, ProviderMetadata,
};
