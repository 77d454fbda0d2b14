//! Provider handles and their advertised metadata

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::provider::{Provider, ProviderKind};

/// Unique identifier for a provider
pub type ProviderId = String;

/// Performance figures a provider advertises to the directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderMetadata {
    /// Typical response time in milliseconds
    pub response_time_ms: u64,
    /// Fraction of successful invocations, 0.0..=1.0
    pub reliability: f64,
    /// Current health, 0.0..=1.0
    pub health_score: f64,
    /// Operations per second, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput: Option<f64>,
}

impl Default for ProviderMetadata {
    fn default() -> Self {
        Self {
            response_time_ms: 0,
            reliability: 1.0,
            health_score: 1.0,
            throughput: None,
        }
    }
}

/// A resolved reference to a provider
///
/// Cheap to clone. The engine treats handles as read-only.
#[derive(Clone)]
pub struct ProviderHandle {
    pub id: ProviderId,
    pub kind: ProviderKind,
    /// Capabilities offered. Operation types count as capabilities.
    pub capabilities: Vec<String>,
    pub metadata: ProviderMetadata,
    pub provider: Arc<dyn Provider>,
}

impl ProviderHandle {
    pub fn new(id: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        Self {
            id: id.into(),
            kind: ProviderKind::default(),
            capabilities: Vec::new(),
            metadata: ProviderMetadata::default(),
            provider,
        }
    }

    pub fn with_kind(mut self, kind: ProviderKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, metadata: ProviderMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// True when every listed capability is offered
    pub fn has_all(&self, capabilities: &[String]) -> bool {
        capabilities.iter().all(|c| self.has_capability(c))
    }
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("capabilities", &self.capabilities)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}
