//! Orchestrator facade
//!
//! Ties the registry, allocator, strategies, executor and analyzer into the
//! `orchestrate` call, tracks active runs and reacts to directory events.
//!
//! All methods take `&self`; wrap the orchestrator in an `Arc` to run
//! several workflows concurrently.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use provider_directory::{CapabilityDirectory, DirectoryEvent, Parameters, ProviderId};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::allocator::Allocator;
use crate::analyzer::{PerformanceAnalyzer, PerformanceHistory};
use crate::config::OrchestratorConfig;
use crate::context::{CancelHandle, ExecutionContext, ExecutionState, FlaggedAllocations};
use crate::error::Result;
use crate::events::{EventSink, NullEventSink, OrchestrationEvent};
use crate::executor::DagExecutor;
use crate::optimization::StrategySet;
use crate::registry::{WorkflowRegistry, WorkflowSummary};
use crate::report::ExecutionReport;
use crate::retry::RetryController;
use crate::types::{SessionId, StepId, WorkflowDefinition, WorkflowId};

/// Bookkeeping for a run that is executing
struct ActiveRun {
    workflow_id: WorkflowId,
    cancel: CancelHandle,
    allocation: HashMap<StepId, ProviderId>,
    flagged: FlaggedAllocations,
}

/// Removes a run from the active set when dropped
struct ActiveRunGuard<'a> {
    runs: &'a RwLock<HashMap<SessionId, ActiveRun>>,
    session_id: SessionId,
}

impl Drop for ActiveRunGuard<'_> {
    fn drop(&mut self) {
        self.runs.write().remove(&self.session_id);
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: RwLock<WorkflowRegistry>,
    directory: Arc<dyn CapabilityDirectory>,
    allocator: Allocator,
    strategies: StrategySet,
    executor: DagExecutor,
    analyzer: PerformanceAnalyzer,
    history: Arc<PerformanceHistory>,
    events: Arc<dyn EventSink>,
    active_runs: RwLock<HashMap<SessionId, ActiveRun>>,
}

impl Orchestrator {
    /// Create an orchestrator with default configuration and no persistence
    pub fn new(directory: Arc<dyn CapabilityDirectory>) -> Self {
        Self::build(directory, OrchestratorConfig::default(), WorkflowRegistry::new())
    }

    /// Create an orchestrator from configuration
    ///
    /// When `registry_path` is set, previously saved workflows are loaded.
    pub fn with_config(
        directory: Arc<dyn CapabilityDirectory>,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        let registry = match &config.registry_path {
            Some(path) => {
                let mut registry = WorkflowRegistry::with_persistence(Path::new(path));
                let count = registry.load_from_disk()?;
                log::info!("Loaded {} workflow(s) from {}", count, path);
                registry
            }
            None => WorkflowRegistry::new(),
        };
        Ok(Self::build(directory, config, registry))
    }

    fn build(
        directory: Arc<dyn CapabilityDirectory>,
        config: OrchestratorConfig,
        registry: WorkflowRegistry,
    ) -> Self {
        let executor = DagExecutor::new(RetryController::from_config(&config))
            .with_default_timeout(config.default_step_timeout_ms.map(Duration::from_millis));

        Self {
            allocator: Allocator::new(Arc::clone(&directory)),
            strategies: StrategySet::with_defaults(config.max_steps_per_provider),
            executor,
            analyzer: PerformanceAnalyzer::from_config(&config),
            history: Arc::new(PerformanceHistory::new(config.history_capacity)),
            events: Arc::new(NullEventSink),
            active_runs: RwLock::new(HashMap::new()),
            registry: RwLock::new(registry),
            directory,
            config,
        }
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Replace the default optimization strategies
    pub fn with_strategies(mut self, strategies: StrategySet) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // =========================================================================
    // Workflow registry
    // =========================================================================

    pub fn register_workflow(&self, workflow: WorkflowDefinition) -> Result<()> {
        self.registry.write().register(workflow)
    }

    pub fn get_workflow(&self, workflow_id: &str) -> Result<Arc<WorkflowDefinition>> {
        self.registry.read().get(workflow_id)
    }

    pub fn list_workflows(&self) -> Vec<WorkflowSummary> {
        self.registry.read().list()
    }

    pub fn remove_workflow(&self, workflow_id: &str) -> Result<bool> {
        Ok(self.registry.write().remove(workflow_id)?.is_some())
    }

    // =========================================================================
    // Orchestration
    // =========================================================================

    /// Run a registered workflow
    ///
    /// Returns `Err` only when the workflow id is unknown. Every other
    /// failure is described by the report.
    pub async fn orchestrate(&self, workflow_id: &str, parameters: Parameters) -> Result<ExecutionReport> {
        self.orchestrate_with_cancel(workflow_id, parameters, CancelHandle::new())
            .await
    }

    /// Run a registered workflow with a caller-held cancellation handle
    pub async fn orchestrate_with_cancel(
        &self,
        workflow_id: &str,
        parameters: Parameters,
        cancel: CancelHandle,
    ) -> Result<ExecutionReport> {
        let workflow = self.get_workflow(workflow_id)?;

        let mut context = ExecutionContext::with_cancel(workflow_id, parameters, cancel.clone());
        log::info!(
            "Orchestrating workflow '{}' (session {})",
            workflow.id,
            context.session_id
        );
        self.emit(OrchestrationEvent::RunStarted {
            workflow_id: workflow.id.clone(),
            session_id: context.session_id.clone(),
        });

        if let Err(error) = self.allocator.allocate(&mut context, &workflow) {
            context
                .execution_log
                .error(None, format!("Allocation failed: {}", error));
            context.transition(ExecutionState::Failed);
            self.emit(OrchestrationEvent::RunFailed {
                workflow_id: workflow.id.clone(),
                session_id: context.session_id.clone(),
                error: error.to_string(),
            });
            return Ok(ExecutionReport::not_started(context, error));
        }

        let history = self.history.snapshot(&workflow.id);
        let optimizations = self.strategies.run(
            &mut context,
            &workflow,
            self.directory.as_ref(),
            &history,
            self.events.as_ref(),
        );

        let guard = self.track(&context, cancel);
        let outcome = self
            .executor
            .execute(&mut context, &workflow, self.events.as_ref())
            .await;
        drop(guard);

        let analysis = self
            .analyzer
            .analyze(&mut context, &workflow, &outcome, &self.history);

        let session_id = context.session_id.clone();
        let event = match (&outcome.error, context.state()) {
            (_, ExecutionState::Cancelled) => OrchestrationEvent::RunCancelled {
                workflow_id: workflow.id.clone(),
                session_id,
            },
            (Some(error), _) => OrchestrationEvent::RunFailed {
                workflow_id: workflow.id.clone(),
                session_id,
                error: error.to_string(),
            },
            (None, _) => OrchestrationEvent::RunCompleted {
                workflow_id: workflow.id.clone(),
                session_id,
                duration_ms: context.performance.total_duration_ms,
            },
        };
        self.emit(event);

        let report = ExecutionReport::new(context, &workflow, outcome, optimizations, analysis);
        log::info!(
            "Workflow '{}' finished: state {:?}, success {}",
            workflow.id,
            report.state(),
            report.success
        );
        Ok(report)
    }

    fn track(&self, context: &ExecutionContext, cancel: CancelHandle) -> ActiveRunGuard<'_> {
        let run = ActiveRun {
            workflow_id: context.workflow_id.clone(),
            cancel,
            allocation: context
                .provider_allocation
                .iter()
                .map(|(step, handle)| (step.clone(), handle.id.clone()))
                .collect(),
            flagged: context.flagged_handle(),
        };
        self.active_runs
            .write()
            .insert(context.session_id.clone(), run);
        ActiveRunGuard {
            runs: &self.active_runs,
            session_id: context.session_id.clone(),
        }
    }

    /// Request cancellation of an active run
    ///
    /// Takes effect before the run's next batch. Returns false when no such
    /// run is active.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.active_runs.read().get(session_id) {
            Some(run) => {
                log::info!(
                    "Cancelling session {} of workflow '{}'",
                    session_id,
                    run.workflow_id
                );
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Session ids of running orchestrations, sorted
    pub fn active_sessions(&self) -> Vec<SessionId> {
        let mut sessions: Vec<SessionId> = self.active_runs.read().keys().cloned().collect();
        sessions.sort();
        sessions
    }

    pub fn history(&self) -> &PerformanceHistory {
        &self.history
    }

    // =========================================================================
    // Directory events
    // =========================================================================

    /// Flag active steps bound to a provider that went unhealthy or away
    ///
    /// Running steps are not interrupted. Returns the number of steps flagged.
    pub fn handle_directory_event(&self, event: &DirectoryEvent) -> usize {
        let unhealthy = match event {
            DirectoryEvent::ProviderDiscovered { .. } => false,
            DirectoryEvent::ProviderUpdated { metadata, .. } => {
                metadata.health_score < self.config.unhealthy_threshold
            }
            DirectoryEvent::ProviderRemoved { .. } => true,
        };
        if !unhealthy {
            return 0;
        }

        let provider_id = event.provider_id();
        let mut flagged = 0;
        let runs = self.active_runs.read();
        for (session_id, run) in runs.iter() {
            let mut steps: Vec<&StepId> = run
                .allocation
                .iter()
                .filter(|(_, p)| p.as_str() == provider_id)
                .map(|(step, _)| step)
                .collect();
            steps.sort();

            for step_id in steps {
                if !run.flagged.lock().insert(step_id.clone()) {
                    continue;
                }
                log::warn!(
                    "Session {}: step '{}' bound to unhealthy provider '{}'",
                    session_id,
                    step_id,
                    provider_id
                );
                self.emit(OrchestrationEvent::AllocationFlagged {
                    session_id: session_id.clone(),
                    step_id: step_id.clone(),
                    provider_id: provider_id.to_string(),
                });
                flagged += 1;
            }
        }
        flagged
    }

    /// Process directory events on a background task
    ///
    /// The task holds a weak reference and stops when the orchestrator is
    /// dropped or the directory channel closes.
    pub fn spawn_directory_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut receiver = self.directory.subscribe();
        let orchestrator = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        let Some(orchestrator) = orchestrator.upgrade() else {
                            break;
                        };
                        orchestrator.handle_directory_event(&event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Directory listener lagged, {} event(s) skipped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            log::debug!("Directory listener stopped");
        })
    }

    fn emit(&self, event: OrchestrationEvent) {
        if let Err(e) = self.events.send(event) {
            log::warn!("Failed to send orchestration event: {}", e);
        }
    }
}
