//! Event types for streaming orchestration progress
//!
//! Events are sent from the orchestrator to any consumer to report run and
//! step progress, retries and allocation changes.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Trait for sending orchestration events
///
/// This abstracts over the transport mechanism (channel, log, UI bridge)
/// so the engine can be embedded in different contexts.
pub trait EventSink: Send + Sync {
    /// Send an event
    ///
    /// Returns an error if the event could not be sent (e.g., channel closed)
    fn send(&self, event: OrchestrationEvent) -> Result<(), EventError>;
}

/// Error when sending events fails
#[derive(Debug, Clone)]
pub struct EventError {
    pub message: String,
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event error: {}", self.message)
    }
}

impl std::error::Error for EventError {}

/// Events emitted during orchestration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OrchestrationEvent {
    #[serde(rename_all = "camelCase")]
    RunStarted {
        workflow_id: String,
        session_id: String,
    },

    #[serde(rename_all = "camelCase")]
    RunCompleted {
        workflow_id: String,
        session_id: String,
        duration_ms: u64,
    },

    #[serde(rename_all = "camelCase")]
    RunFailed {
        workflow_id: String,
        session_id: String,
        error: String,
    },

    #[serde(rename_all = "camelCase")]
    RunCancelled {
        workflow_id: String,
        session_id: String,
    },

    #[serde(rename_all = "camelCase")]
    StepStarted {
        session_id: String,
        step_id: String,
        provider_id: String,
    },

    /// A failed attempt will be retried after `delay_ms`
    #[serde(rename_all = "camelCase")]
    StepRetrying {
        session_id: String,
        step_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    #[serde(rename_all = "camelCase")]
    StepCompleted {
        session_id: String,
        step_id: String,
        duration_ms: u64,
    },

    #[serde(rename_all = "camelCase")]
    StepFailed {
        session_id: String,
        step_id: String,
        attempts: u32,
        error: String,
    },

    /// A step's provider went unhealthy or disappeared mid-run
    #[serde(rename_all = "camelCase")]
    AllocationFlagged {
        session_id: String,
        step_id: String,
        provider_id: String,
    },

    #[serde(rename_all = "camelCase")]
    StrategyApplied {
        session_id: String,
        strategy: String,
        modifications: usize,
    },

    #[serde(rename_all = "camelCase")]
    StrategySkipped {
        session_id: String,
        strategy: String,
        reason: String,
    },
}

/// A no-op event sink that discards all events
///
/// Useful for testing or when events aren't needed.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: OrchestrationEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// A vector-based event sink that collects events
///
/// Useful for testing to verify events were emitted correctly.
pub struct VecEventSink {
    events: Mutex<Vec<OrchestrationEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<OrchestrationEvent> {
        self.events.lock().clone()
    }

    /// Clear all collected events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Default for VecEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: OrchestrationEvent) -> Result<(), EventError> {
        self.events.lock().push(event);
        Ok(())
    }
}
