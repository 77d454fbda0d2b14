//! Orchestrator configuration storage

use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

/// Tunables for the orchestrator
///
/// Every field has a default, so a partial JSON file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// Base backoff delay in milliseconds
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    /// Upper bound for a single backoff delay
    #[serde(default)]
    pub max_retry_delay_ms: Option<u64>,
    /// Per-attempt timeout for steps that declare none
    #[serde(default)]
    pub default_step_timeout_ms: Option<u64>,
    /// Runs kept per workflow in the performance history
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Average step duration above which parallelization is suggested
    #[serde(default = "default_slow_step_threshold")]
    pub slow_step_threshold_ms: u64,
    /// Throughput below which a dependency review is suggested
    #[serde(default = "default_min_throughput")]
    pub min_throughput_per_sec: f64,
    /// Health score below which a provider's steps are flagged
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: f64,
    /// Directory for persisted workflow definitions
    #[serde(default)]
    pub registry_path: Option<String>,
    /// Load-spread limit per provider within one run
    #[serde(default = "default_max_steps_per_provider")]
    pub max_steps_per_provider: usize,
}

fn default_retry_base_delay() -> u64 {
    1000
}

fn default_history_capacity() -> usize {
    50
}

fn default_slow_step_threshold() -> u64 {
    5000
}

fn default_min_throughput() -> f64 {
    1.0
}

fn default_unhealthy_threshold() -> f64 {
    0.5
}

fn default_max_steps_per_provider() -> usize {
    4
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry_base_delay_ms: default_retry_base_delay(),
            max_retry_delay_ms: None,
            default_step_timeout_ms: None,
            history_capacity: default_history_capacity(),
            slow_step_threshold_ms: default_slow_step_threshold(),
            min_throughput_per_sec: default_min_throughput(),
            unhealthy_threshold: default_unhealthy_threshold(),
            registry_path: None,
            max_steps_per_provider: default_max_steps_per_provider(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from disk
    ///
    /// A missing file yields the defaults.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).await?;
        serde_json::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save configuration to disk
    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let contents = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        fs::write(path, contents).await?;

        log::info!("Configuration saved to {:?}", path);
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(serde_json::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = OrchestratorConfig::load(&dir.path().join("absent.json"))
            .await
            .unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.retry_base_delay_ms, 1000);
        assert_eq!(config.history_capacity, 50);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("orchestrator.json");

        let config = OrchestratorConfig {
            retry_base_delay_ms: 10,
            max_retry_delay_ms: Some(500),
            ..OrchestratorConfig::default()
        };
        config.save(&path).await.unwrap();

        let loaded = OrchestratorConfig::load(&path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"unhealthyThreshold": 0.3}"#).unwrap();
        assert_eq!(config.unhealthy_threshold, 0.3);
        assert_eq!(config.slow_step_threshold_ms, 5000);
    }

    #[tokio::test]
    async fn test_invalid_json_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{").unwrap();

        let err = OrchestratorConfig::load(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
