//! Error types for the orchestration engine

use provider_directory::ProviderError;
use thiserror::Error;

/// Result type alias using OrchestrationError
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Errors that can occur while registering or running workflows
///
/// Cloneable so a run's terminal error can live in both the report and the
/// emitted events.
#[derive(Debug, Clone, Error)]
pub enum OrchestrationError {
    /// Definition failed validation at registration
    #[error("Invalid workflow '{workflow_id}': {}", reasons.join("; "))]
    InvalidWorkflow {
        workflow_id: String,
        reasons: Vec<String>,
    },

    /// No workflow registered under this id
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// The directory has no provider for this step
    #[error("No provider available for step '{0}'")]
    NoProviderAvailable(String),

    /// Providers exist but none meets the step's performance requirements
    #[error("Performance constraints unsatisfiable for step '{0}'")]
    ConstraintUnsatisfiable(String),

    /// Steps remain but none of them is ready
    #[error("Circular or unresolved dependency among steps: {}", pending.join(", "))]
    CircularOrUnresolvedDependency { pending: Vec<String> },

    /// A step failed after its retry budget
    #[error("Step '{step_id}' failed after {attempts} attempt(s): {source}")]
    StepExecution {
        step_id: String,
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    /// Abort fallback stopped the run
    #[error("Orchestration aborted at step '{step_id}': {reason}")]
    OrchestrationAborted { step_id: String, reason: String },

    /// Run was cancelled
    #[error("Orchestration cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl OrchestrationError {
    /// Create an invalid-workflow error from validation messages
    pub fn invalid(workflow_id: impl Into<String>, reasons: Vec<String>) -> Self {
        Self::InvalidWorkflow {
            workflow_id: workflow_id.into(),
            reasons,
        }
    }
}

impl From<std::io::Error> for OrchestrationError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestrationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
