//! The provider call surface
//!
//! A provider is an independent worker invoked by operation name with a
//! parameter map. Everything protocol-specific lives behind `execute`; the
//! engine never sees more than this trait.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Parameter map passed to providers
pub type Parameters = HashMap<String, serde_json::Value>;

/// An external unit of execution
#[async_trait]
pub trait Provider: Send + Sync {
    /// Execute a named operation with the given parameters
    async fn execute(
        &self,
        operation: &str,
        parameters: Parameters,
    ) -> Result<serde_json::Value, ProviderError>;
}

/// Built-in provider kinds
///
/// Only descriptive: dispatch always goes through the `Provider` trait.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderKind {
    /// Runs inside this process
    #[default]
    InProcess,
    /// Reached over the network
    Remote { endpoint: String },
    /// Bridges into an external application
    Application { name: String },
}

type ProviderFuture =
    Pin<Box<dyn Future<Output = Result<serde_json::Value, ProviderError>> + Send>>;

/// Async callback-based provider
///
/// Wraps an async closure as a `Provider`. Handy for in-process providers
/// and for bridging foreign runtimes where each operation is a callback.
pub struct FnProvider {
    callback: Box<dyn Fn(String, Parameters) -> ProviderFuture + Send + Sync>,
}

impl FnProvider {
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F: Fn(String, Parameters) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, ProviderError>> + Send + 'static,
    {
        Self {
            callback: Box::new(move |operation, parameters| {
                Box::pin(callback(operation, parameters))
            }),
        }
    }
}

#[async_trait]
impl Provider for FnProvider {
    async fn execute(
        &self,
        operation: &str,
        parameters: Parameters,
    ) -> Result<serde_json::Value, ProviderError> {
        (self.callback)(operation.to_string(), parameters).await
    }
}

impl std::fmt::Debug for FnProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnProvider").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fn_provider_echoes_operation() {
        let provider = FnProvider::new(|operation, parameters| async move {
            Ok(serde_json::json!({
                "operation": operation,
                "count": parameters.len(),
            }))
        });

        let mut params = Parameters::new();
        params.insert("width".to_string(), serde_json::json!(640));

        let out = provider.execute("render", params).await.unwrap();
        assert_eq!(out["operation"], "render");
        assert_eq!(out["count"], 1);
    }

    #[tokio::test]
    async fn test_fn_provider_propagates_errors() {
        let provider = FnProvider::new(|operation, _| async move {
            Err(ProviderError::UnsupportedOperation(operation))
        });

        let err = provider.execute("compile", Parameters::new()).await.unwrap_err();
        assert_eq!(err, ProviderError::UnsupportedOperation("compile".to_string()));
    }

    #[test]
    fn test_provider_kind_serialization() {
        let kind = ProviderKind::Remote {
            endpoint: "http://localhost:9000".to_string(),
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "remote");
        assert_eq!(json["endpoint"], "http://localhost:9000");
    }
}
