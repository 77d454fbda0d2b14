//! Error types for providers and the capability directory

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using DirectoryError
pub type Result<T> = std::result::Result<T, DirectoryError>;

/// Errors a provider can return from `execute`
///
/// Every variant maps to a stable `kind()` string. Retry policies match
/// against that string, so it must not change between releases.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ProviderError {
    /// The invocation did not finish within its time budget
    #[error("Provider timed out: {0}")]
    Timeout(String),

    /// The provider could not be reached or is shutting down
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    /// The provider does not implement the requested operation
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Provider-specific failure with its own error kind
    #[error("{kind}: {message}")]
    Execution { kind: String, message: String },
}

impl ProviderError {
    /// Create a provider-specific failure
    pub fn execution(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Stable error kind used for retryable-error matching
    pub fn kind(&self) -> &str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Unavailable(_) => "unavailable",
            Self::UnsupportedOperation(_) => "unsupported_operation",
            Self::Execution { kind, .. } => kind,
        }
    }
}

/// Errors raised by directory bookkeeping
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// No provider with this id is registered
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// A provider with this id is already registered
    #[error("Provider already registered: {0}")]
    DuplicateProvider(String),
}
