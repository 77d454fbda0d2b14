//! Per-run execution state
//!
//! One `ExecutionContext` is created per `orchestrate` call and handed back
//! in the report. It is never shared between runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use provider_directory::{Parameters, ProviderHandle, ProviderId};
use serde::{Deserialize, Serialize};

use crate::types::{SessionId, StepId, WorkflowId};

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    fn can_transition_to(&self, next: ExecutionState) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running | Self::Failed | Self::Cancelled) => true,
            (Self::Running, Self::Completed | Self::Failed | Self::Cancelled) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    pub message: String,
}

/// Append-only run log
///
/// Appends go through `&self` so concurrent steps of one batch can write.
/// Every entry is mirrored to the `log` facade.
#[derive(Debug, Default)]
pub struct ExecutionLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, level: LogLevel, step_id: Option<&str>, message: impl Into<String>) {
        let message = message.into();
        let target_level = match level {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        };
        match step_id {
            Some(step) => log::log!(target_level, "[{}] {}", step, message),
            None => log::log!(target_level, "{}", message),
        }

        self.entries.lock().push(LogEntry {
            timestamp: Utc::now(),
            level,
            step_id: step_id.map(str::to_string),
            message,
        });
    }

    pub fn info(&self, step_id: Option<&str>, message: impl Into<String>) {
        self.append(LogLevel::Info, step_id, message);
    }

    pub fn warn(&self, step_id: Option<&str>, message: impl Into<String>) {
        self.append(LogLevel::Warn, step_id, message);
    }

    pub fn error(&self, step_id: Option<&str>, message: impl Into<String>) {
        self.append(LogLevel::Error, step_id, message);
    }

    /// Snapshot of all entries in append order
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Timing and load figures collected while a run executes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceRecord {
    /// Wall time of each settled step, retries and backoff included
    pub step_durations_ms: HashMap<StepId, u64>,
    /// Busy time accumulated per provider
    pub provider_utilization_ms: HashMap<ProviderId, u64>,
    pub total_duration_ms: u64,
    /// Completed steps per second
    pub throughput: f64,
    /// Most steps ever in flight at once
    pub peak_concurrency: usize,
    pub batches: usize,
}

/// Cooperative cancellation flag, checked before each batch
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Steps whose provider went unhealthy during a run
pub(crate) type FlaggedAllocations = Arc<Mutex<HashSet<StepId>>>;

/// State of a single orchestration run
#[derive(Debug)]
pub struct ExecutionContext {
    pub workflow_id: WorkflowId,
    pub session_id: SessionId,
    pub started_at: DateTime<Utc>,
    start: Instant,
    /// Caller-supplied run parameters
    pub parameters: Parameters,
    /// Step to bound provider; frozen once execution starts
    pub provider_allocation: HashMap<StepId, ProviderHandle>,
    /// Parameter adjustments written by optimization strategies
    pub step_overrides: HashMap<StepId, Parameters>,
    pub execution_log: ExecutionLog,
    pub performance: PerformanceRecord,
    state: ExecutionState,
    flagged: FlaggedAllocations,
    cancel: CancelHandle,
}

impl ExecutionContext {
    pub fn new(workflow_id: impl Into<String>, parameters: Parameters) -> Self {
        Self::with_cancel(workflow_id, parameters, CancelHandle::new())
    }

    pub fn with_cancel(
        workflow_id: impl Into<String>,
        parameters: Parameters,
        cancel: CancelHandle,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            session_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            start: Instant::now(),
            parameters,
            provider_allocation: HashMap::new(),
            step_overrides: HashMap::new(),
            execution_log: ExecutionLog::new(),
            performance: PerformanceRecord::default(),
            state: ExecutionState::Pending,
            flagged: Arc::new(Mutex::new(HashSet::new())),
            cancel,
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    /// Move to `next` if the lifecycle allows it
    ///
    /// Returns false and leaves the state unchanged otherwise.
    pub fn transition(&mut self, next: ExecutionState) -> bool {
        if self.state.can_transition_to(next) {
            log::debug!(
                "Session {} state {:?} -> {:?}",
                self.session_id,
                self.state,
                next
            );
            self.state = next;
            true
        } else {
            false
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Mark a step for reallocation on a future run
    pub fn flag_allocation(&self, step_id: &str) {
        self.flagged.lock().insert(step_id.to_string());
    }

    /// Flagged step ids, sorted
    pub fn flagged_allocations(&self) -> Vec<StepId> {
        let mut steps: Vec<StepId> = self.flagged.lock().iter().cloned().collect();
        steps.sort();
        steps
    }

    pub(crate) fn flagged_handle(&self) -> FlaggedAllocations {
        Arc::clone(&self.flagged)
    }
}
