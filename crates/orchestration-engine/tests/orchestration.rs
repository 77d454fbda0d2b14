//! End-to-end runs through the orchestrator against an in-memory directory

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orchestration_engine::{
    BackoffStrategy, CancelHandle, ExecutionState, FallbackStrategy, InMemoryDirectory,
    OrchestrationError, OrchestrationEvent, Orchestrator, OrchestratorConfig, Parameters,
    PerformanceRequirements, Provider, ProviderError, ProviderHandle, ProviderMetadata,
    Requirements, VecEventSink, WorkflowBuilder,
};
use parking_lot::Mutex;
use tokio_test::assert_ok;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Provider whose behavior is chosen by operation name
///
/// - `fail`: always fails with a non-retryable kind
/// - `flaky`: fails twice, then succeeds
/// - `slowing`: like the default, but 1500 ms slower after the first call
/// - anything else: sleeps `delay`, then echoes its inputs
struct ScriptedProvider {
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    trace: Mutex<Vec<(String, &'static str)>>,
}

impl ScriptedProvider {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            trace: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn position(&self, operation: &str, phase: &str) -> usize {
        self.trace
            .lock()
            .iter()
            .position(|(op, p)| op == operation && *p == phase)
            .unwrap_or_else(|| panic!("no '{}' {} in trace", operation, phase))
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn execute(
        &self,
        operation: &str,
        parameters: Parameters,
    ) -> Result<serde_json::Value, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match operation {
            "fail" => return Err(ProviderError::execution("broken", "scripted failure")),
            "flaky" if call <= 2 => {
                return Err(ProviderError::execution("flaky", "not yet"));
            }
            "slowing" if call > 1 => tokio::time::sleep(Duration::from_millis(1500)).await,
            _ => {}
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.trace.lock().push((operation.to_string(), "start"));

        tokio::time::sleep(self.delay).await;

        self.trace.lock().push((operation.to_string(), "end"));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        Ok(serde_json::json!({
            "operation": operation,
            "dependencies": parameters.get("_dependencies").cloned(),
        }))
    }
}

fn directory_with(provider: Arc<ScriptedProvider>, capabilities: &[&str]) -> Arc<InMemoryDirectory> {
    let directory = Arc::new(InMemoryDirectory::new());
    directory
        .register(
            ProviderHandle::new("worker", provider).with_capabilities(capabilities.iter().copied()),
        )
        .unwrap();
    directory
}

#[tokio::test(start_paused = true)]
async fn test_diamond_runs_siblings_in_one_batch() {
    init_logging();
    let provider = ScriptedProvider::new(Duration::from_millis(50));
    let orchestrator = Orchestrator::new(directory_with(
        provider.clone(),
        &["op_a", "op_b", "op_c", "op_d"],
    ));
    assert_ok!(orchestrator.register_workflow(
        WorkflowBuilder::new("diamond", "Diamond")
            .step("a", "op_a")
            .step("b", "op_b")
            .depends_on(["a"])
            .step("c", "op_c")
            .depends_on(["a"])
            .step("d", "op_d")
            .depends_on(["b", "c"])
            .max_concurrency(2)
            .build()
    ));

    let report = assert_ok!(orchestrator.orchestrate("diamond", Parameters::new()).await);

    assert!(report.success);
    assert_eq!(report.state(), ExecutionState::Completed);
    assert_eq!(report.context.performance.batches, 3);
    assert_eq!(report.context.performance.peak_concurrency, 2);
    assert_eq!(provider.peak(), 2);

    // b and c both start before either finishes
    let b_start = provider.position("op_b", "start");
    let c_start = provider.position("op_c", "start");
    let first_end = provider.position("op_b", "end").min(provider.position("op_c", "end"));
    assert!(b_start < first_end && c_start < first_end);

    // d starts only after both finished
    let d_start = provider.position("op_d", "start");
    assert!(d_start > provider.position("op_b", "end"));
    assert!(d_start > provider.position("op_c", "end"));

    let d = report.output("d").unwrap();
    assert_eq!(d["dependencies"]["b"]["operation"], "op_b");
    assert_eq!(d["dependencies"]["c"]["operation"], "op_c");
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_never_exceeds_max_concurrency() {
    init_logging();
    let provider = ScriptedProvider::new(Duration::from_millis(10));
    let orchestrator = Orchestrator::new(directory_with(provider.clone(), &["work"]));

    let mut builder = WorkflowBuilder::new("wide", "Wide").max_concurrency(3);
    for i in 0..8 {
        builder = builder.step(format!("s{}", i), "work");
    }
    assert_ok!(orchestrator.register_workflow(builder.build()));

    let report = assert_ok!(orchestrator.orchestrate("wide", Parameters::new()).await);

    assert!(report.success);
    assert_eq!(provider.calls(), 8);
    assert_eq!(provider.peak(), 3);
    assert_eq!(report.context.performance.peak_concurrency, 3);
    assert_eq!(report.context.performance.batches, 3);
}

#[tokio::test]
async fn test_self_dependency_is_rejected_at_registration() {
    init_logging();
    let provider = ScriptedProvider::new(Duration::ZERO);
    let orchestrator = Orchestrator::new(directory_with(provider, &["op"]));

    let err = orchestrator
        .register_workflow(
            WorkflowBuilder::new("loop", "Self loop")
                .step("s", "op")
                .depends_on(["s"])
                .build(),
        )
        .unwrap_err();

    match err {
        OrchestrationError::InvalidWorkflow { workflow_id, reasons } => {
            assert_eq!(workflow_id, "loop");
            assert!(reasons.iter().any(|r| r.contains("'s'")));
        }
        other => panic!("Expected InvalidWorkflow, got {:?}", other),
    }
    assert!(orchestrator.list_workflows().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_flaky_step_succeeds_after_shrinking_backoff() {
    init_logging();
    let provider = ScriptedProvider::new(Duration::ZERO);
    let sink = Arc::new(VecEventSink::new());
    let config = OrchestratorConfig {
        retry_base_delay_ms: 1000,
        ..OrchestratorConfig::default()
    };
    let orchestrator = assert_ok!(Orchestrator::with_config(
        directory_with(provider.clone(), &["flaky"]),
        config
    ))
    .with_event_sink(sink.clone());
    assert_ok!(orchestrator.register_workflow(
        WorkflowBuilder::new("retry", "Retry")
            .step("s", "flaky")
            .with_retry(2, BackoffStrategy::Exponential)
            .build()
    ));

    let report = assert_ok!(orchestrator.orchestrate("retry", Parameters::new()).await);

    assert!(report.success);
    assert!(report.results["s"].is_success());
    assert_eq!(provider.calls(), 3);

    let delays: Vec<u64> = sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            OrchestrationEvent::StepRetrying { delay_ms, .. } => Some(delay_ms),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![4000, 2000]);
}

#[tokio::test]
async fn test_unsatisfiable_constraint_runs_nothing() {
    init_logging();
    let provider = ScriptedProvider::new(Duration::ZERO);
    let directory = Arc::new(InMemoryDirectory::new());
    directory
        .register(
            ProviderHandle::new("unreliable", provider.clone())
                .with_capabilities(["op"])
                .with_metadata(ProviderMetadata {
                    reliability: 0.5,
                    ..ProviderMetadata::default()
                }),
        )
        .unwrap();
    let orchestrator = Orchestrator::new(directory);
    assert_ok!(orchestrator.register_workflow(
        WorkflowBuilder::new("strict", "Strict")
            .step("s", "op")
            .with_requirements(Requirements {
                performance: PerformanceRequirements {
                    min_reliability: Some(0.9),
                    ..PerformanceRequirements::default()
                },
                ..Requirements::default()
            })
            .build()
    ));

    let report = assert_ok!(orchestrator.orchestrate("strict", Parameters::new()).await);

    assert!(!report.success);
    assert_eq!(report.state(), ExecutionState::Failed);
    assert!(matches!(
        report.error,
        Some(OrchestrationError::ConstraintUnsatisfiable(ref step)) if step == "s"
    ));
    assert!(report.results.is_empty());
    assert_eq!(provider.calls(), 0);
    assert_eq!(
        report.recommendations,
        vec!["Step 's' could not be allocated: no provider meets its latency and reliability limits"]
    );
}

#[tokio::test]
async fn test_abort_stops_the_run_at_first_failure() {
    init_logging();
    let provider = ScriptedProvider::new(Duration::ZERO);
    let orchestrator = Orchestrator::new(directory_with(provider.clone(), &["fail", "op"]));
    assert_ok!(orchestrator.register_workflow(
        WorkflowBuilder::new("abort", "Abort")
            .step("a", "fail")
            .step("b", "op")
            .depends_on(["a"])
            .step("c", "op")
            .error_policy(0.0, FallbackStrategy::Abort)
            .build()
    ));

    let report = assert_ok!(orchestrator.orchestrate("abort", Parameters::new()).await);

    assert!(!report.success);
    assert_eq!(report.state(), ExecutionState::Failed);
    assert!(matches!(
        report.error,
        Some(OrchestrationError::OrchestrationAborted { ref step_id, .. }) if step_id == "a"
    ));
    assert_eq!(report.errors.len(), 1);
    assert!(!report.results.contains_key("b"));
    assert!(!report.results.contains_key("c"));
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn test_continue_hands_failure_marker_to_dependents() {
    init_logging();
    let provider = ScriptedProvider::new(Duration::ZERO);
    let orchestrator = Orchestrator::new(directory_with(provider, &["fail", "op"]));
    assert_ok!(orchestrator.register_workflow(
        WorkflowBuilder::new("strict", "Strict")
            .step("a", "fail")
            .step("b", "op")
            .depends_on(["a"])
            .error_policy(0.0, FallbackStrategy::Continue)
            .build()
    ));
    assert_ok!(orchestrator.register_workflow(
        WorkflowBuilder::new("tolerant", "Tolerant")
            .step("a", "fail")
            .step("b", "op")
            .depends_on(["a"])
            .error_policy(0.5, FallbackStrategy::Degraded)
            .build()
    ));

    let strict = assert_ok!(orchestrator.orchestrate("strict", Parameters::new()).await);
    assert_eq!(strict.state(), ExecutionState::Completed);
    assert!(strict.is_degraded());
    assert!(!strict.success);
    let marker = &strict.output("b").unwrap()["dependencies"]["a"];
    assert_eq!(marker["failed"], true);
    assert_eq!(marker["kind"], "broken");

    let tolerant = assert_ok!(orchestrator.orchestrate("tolerant", Parameters::new()).await);
    assert!(tolerant.is_degraded());
    assert!(tolerant.success);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_before_next_batch() {
    init_logging();
    let provider = ScriptedProvider::new(Duration::from_millis(100));
    let sink = Arc::new(VecEventSink::new());
    let orchestrator =
        Orchestrator::new(directory_with(provider.clone(), &["op"])).with_event_sink(sink.clone());
    assert_ok!(orchestrator.register_workflow(
        WorkflowBuilder::new("chain", "Chain")
            .step("a", "op")
            .step("b", "op")
            .depends_on(["a"])
            .build()
    ));

    let (report, cancelled) = tokio::join!(
        orchestrator.orchestrate_with_cancel("chain", Parameters::new(), CancelHandle::new()),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let sessions = orchestrator.active_sessions();
            assert_eq!(sessions.len(), 1);
            orchestrator.cancel(&sessions[0])
        }
    );

    assert!(cancelled);
    let report = assert_ok!(report);
    assert_eq!(report.state(), ExecutionState::Cancelled);
    assert!(!report.success);
    assert!(matches!(report.error, Some(OrchestrationError::Cancelled)));
    assert!(report.results["a"].is_success());
    assert!(!report.results.contains_key("b"));
    assert_eq!(provider.calls(), 1);
    assert!(orchestrator.active_sessions().is_empty());
    assert!(matches!(
        sink.events().last(),
        Some(OrchestrationEvent::RunCancelled { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_listener_flags_steps_on_unhealthy_provider() {
    init_logging();
    let provider = ScriptedProvider::new(Duration::from_millis(100));
    let directory = directory_with(provider, &["op"]);
    let sink = Arc::new(VecEventSink::new());
    let orchestrator =
        Arc::new(Orchestrator::new(directory.clone()).with_event_sink(sink.clone()));
    let listener = orchestrator.spawn_directory_listener();
    assert_ok!(orchestrator.register_workflow(
        WorkflowBuilder::new("watched", "Watched").step("a", "op").build()
    ));

    let (report, _) = tokio::join!(orchestrator.orchestrate("watched", Parameters::new()), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        directory
            .update_metadata(
                "worker",
                ProviderMetadata {
                    health_score: 0.1,
                    ..ProviderMetadata::default()
                },
            )
            .unwrap();
    });

    let report = assert_ok!(report);
    // Flagged steps keep running to completion
    assert!(report.success);
    assert_eq!(report.context.flagged_allocations(), vec!["a"]);
    assert!(sink.events().iter().any(|e| matches!(
        e,
        OrchestrationEvent::AllocationFlagged { step_id, provider_id, .. }
            if step_id == "a" && provider_id == "worker"
    )));

    drop(orchestrator);
    directory
        .update_metadata("worker", ProviderMetadata::default())
        .unwrap();
    assert_ok!(listener.await);
}

#[tokio::test]
async fn test_registry_path_survives_restart() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let config = OrchestratorConfig {
        registry_path: Some(dir.path().join("workflows").to_string_lossy().into_owned()),
        ..OrchestratorConfig::default()
    };

    {
        let provider = ScriptedProvider::new(Duration::ZERO);
        let orchestrator = assert_ok!(Orchestrator::with_config(
            directory_with(provider, &["op"]),
            config.clone()
        ));
        assert_ok!(orchestrator.register_workflow(
            WorkflowBuilder::new("kept", "Kept")
                .description("Persists across restarts")
                .step("a", "op")
                .build()
        ));
    }

    let provider = ScriptedProvider::new(Duration::ZERO);
    let orchestrator = assert_ok!(Orchestrator::with_config(
        directory_with(provider.clone(), &["op"]),
        config
    ));
    let listed = orchestrator.list_workflows();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, "kept");

    let report = assert_ok!(orchestrator.orchestrate("kept", Parameters::new()).await);
    assert!(report.success);
    assert_eq!(provider.calls(), 1);

    assert!(assert_ok!(orchestrator.remove_workflow("kept")));
    assert!(orchestrator.list_workflows().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_slower_second_run_is_not_timed_out() {
    init_logging();
    let provider = ScriptedProvider::new(Duration::from_millis(10));
    let orchestrator = Orchestrator::new(directory_with(provider.clone(), &["slowing"]));
    assert_ok!(orchestrator.register_workflow(
        WorkflowBuilder::new("unbounded", "No declared timeout")
            .step("a", "slowing")
            .build()
    ));

    let first = assert_ok!(orchestrator.orchestrate("unbounded", Parameters::new()).await);
    assert!(first.success);

    let second = assert_ok!(orchestrator.orchestrate("unbounded", Parameters::new()).await);
    assert!(second.success, "second run failed: {:?}", second.error);
    assert_eq!(second.state(), ExecutionState::Completed);
    assert!(second.context.step_overrides.is_empty());
    assert_eq!(provider.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_runs_of_one_workflow_stay_separate() {
    init_logging();
    let provider = ScriptedProvider::new(Duration::from_millis(5));
    let orchestrator = Arc::new(Orchestrator::new(directory_with(provider.clone(), &["op"])));
    assert_ok!(orchestrator.register_workflow(
        WorkflowBuilder::new("shared", "Shared")
            .step("a", "op")
            .step("b", "op")
            .depends_on(["a"])
            .build()
    ));

    let runs: Vec<_> = (0..8)
        .map(|i| {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                let mut parameters = Parameters::new();
                parameters.insert("run".to_string(), serde_json::json!(i));
                orchestrator.orchestrate("shared", parameters).await
            })
        })
        .collect();

    let mut sessions = HashSet::new();
    for run in runs {
        let report = assert_ok!(assert_ok!(run.await));
        assert!(report.success);
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.context.workflow_id, "shared");
        assert!(sessions.insert(report.context.session_id.clone()));
    }

    assert_eq!(sessions.len(), 8);
    assert_eq!(provider.calls(), 16);
    assert_eq!(orchestrator.history().len("shared"), 8);
    assert!(orchestrator.active_sessions().is_empty());
}

#[tokio::test]
async fn test_continue_runs_every_step_below_a_failure() {
    init_logging();
    let provider = ScriptedProvider::new(Duration::ZERO);
    let orchestrator = Orchestrator::new(directory_with(provider.clone(), &["fail", "op"]));
    assert_ok!(orchestrator.register_workflow(
        WorkflowBuilder::new("deep", "Deep")
            .step("a", "fail")
            .step("b", "op")
            .depends_on(["a"])
            .step("c", "op")
            .depends_on(["b"])
            .error_policy(0.0, FallbackStrategy::Continue)
            .build()
    ));

    let report = assert_ok!(orchestrator.orchestrate("deep", Parameters::new()).await);

    assert_eq!(report.state(), ExecutionState::Completed);
    assert_eq!(report.results.len(), 3);
    assert!(!report.results["a"].is_success());
    assert!(report.results["b"].is_success());
    let c = report.output("c").unwrap();
    assert_eq!(c["dependencies"]["b"]["dependencies"]["a"]["failed"], true);
    assert_eq!(provider.calls(), 3);
}

#[tokio::test]
async fn test_abort_keeps_sibling_that_succeeded_in_the_same_batch() {
    init_logging();
    let provider = ScriptedProvider::new(Duration::ZERO);
    let orchestrator = Orchestrator::new(directory_with(provider.clone(), &["fail", "op"]));
    assert_ok!(orchestrator.register_workflow(
        WorkflowBuilder::new("siblings", "Siblings")
            .step("a", "fail")
            .step("b", "op")
            .step("c", "op")
            .depends_on(["b"])
            .max_concurrency(2)
            .error_policy(0.0, FallbackStrategy::Abort)
            .build()
    ));

    let report = assert_ok!(orchestrator.orchestrate("siblings", Parameters::new()).await);

    assert_eq!(report.state(), ExecutionState::Failed);
    assert!(matches!(
        report.error,
        Some(OrchestrationError::OrchestrationAborted { ref step_id, .. }) if step_id == "a"
    ));
    assert!(report.results["b"].is_success());
    assert!(!report.results.contains_key("a"));
    assert!(!report.results.contains_key("c"));
    assert_eq!(report.errors.len(), 1);
    assert_eq!(provider.calls(), 2);
}
