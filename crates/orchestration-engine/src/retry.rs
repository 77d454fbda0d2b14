//! Bounded retry with backoff
//!
//! Each step invocation runs inside `run_with_retry`. The loop makes at most
//! `max_retries + 1` attempts; the delay before a retry depends on how much
//! of the budget is left.

use std::future::Future;
use std::time::Duration;

use provider_directory::ProviderError;

use crate::config::OrchestratorConfig;
use crate::types::{BackoffStrategy, Step};

/// Result of a retried invocation
#[derive(Debug, Clone)]
pub struct RetryOutcome {
    /// Last attempt's result
    pub result: Result<serde_json::Value, ProviderError>,
    /// Attempts made, at least 1
    pub attempts: u32,
    /// Delay waited before each retry, in order
    pub delays: Vec<Duration>,
}

#[derive(Debug, Clone)]
pub struct RetryController {
    base_delay: Duration,
    max_delay: Option<Duration>,
}

impl Default for RetryController {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}

impl RetryController {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: config.max_retry_delay_ms.map(Duration::from_millis),
        }
    }

    /// Delay before the next retry when `remaining` retries are left
    ///
    /// Linear waits `base` every time. Exponential waits `2^remaining * base`,
    /// so earlier retries wait longer than later ones.
    pub fn backoff_delay(&self, strategy: BackoffStrategy, remaining: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let delay_ms = match strategy {
            BackoffStrategy::Linear => base_ms,
            BackoffStrategy::Exponential => base_ms.saturating_mul(1u64 << remaining.min(20)),
        };
        let delay = Duration::from_millis(delay_ms);
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Invoke with retries per the step's policy
    pub async fn run_with_retry<F, Fut>(&self, step: &Step, invoke: F) -> RetryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<serde_json::Value, ProviderError>>,
    {
        self.run_with_retry_observed(step, invoke, |_, _, _| {}).await
    }

    /// Like `run_with_retry`, calling `on_retry(attempt, error, delay)`
    /// before each backoff wait
    pub async fn run_with_retry_observed<F, Fut, R>(
        &self,
        step: &Step,
        mut invoke: F,
        mut on_retry: R,
    ) -> RetryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<serde_json::Value, ProviderError>>,
        R: FnMut(u32, &ProviderError, Duration),
    {
        let policy = &step.retry_policy;
        let mut remaining = policy.max_retries;
        let mut attempts = 0u32;
        let mut delays = Vec::new();

        loop {
            attempts += 1;
            let error = match invoke(attempts).await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                        delays,
                    }
                }
                Err(error) => error,
            };

            if remaining == 0 || !policy.is_retryable(error.kind()) {
                log::debug!(
                    "Step '{}' giving up after {} attempt(s): {}",
                    step.id,
                    attempts,
                    error
                );
                return RetryOutcome {
                    result: Err(error),
                    attempts,
                    delays,
                };
            }

            let delay = self.backoff_delay(policy.backoff_strategy, remaining);
            log::debug!(
                "Step '{}' attempt {} failed ({}), retrying in {:?}",
                step.id,
                attempts,
                error.kind(),
                delay
            );
            on_retry(attempts, &error, delay);
            delays.push(delay);
            remaining -= 1;
            tokio::time::sleep(delay).await;
        }
    }
}
