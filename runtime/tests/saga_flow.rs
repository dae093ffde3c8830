//! Saga orchestrator tests: the state machine, context threading, and
//! compensation totality.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code uses unwrap/expect

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use taskflow_core::saga::{
    SagaContext, SagaDefinition, SagaError, SagaRegistry, SagaStatus, SagaStep, SagaStore,
};
use taskflow_runtime::saga::SagaOrchestrator;
use taskflow_testing::stores::InMemorySagaStore;
use taskflow_testing::test_clock;

/// Step that records execute/compensate calls into a shared journal.
struct RecordingStep {
    name: String,
    journal: Arc<Mutex<Vec<String>>>,
    result: serde_json::Value,
    fail_execute: bool,
    fail_compensate: bool,
}

impl RecordingStep {
    fn ok(name: &str, journal: &Arc<Mutex<Vec<String>>>, result: serde_json::Value) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            journal: Arc::clone(journal),
            result,
            fail_execute: false,
            fail_compensate: false,
        })
    }

    fn failing(name: &str, journal: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            journal: Arc::clone(journal),
            result: serde_json::Value::Null,
            fail_execute: true,
            fail_compensate: false,
        })
    }

    fn with_failing_compensation(
        name: &str,
        journal: &Arc<Mutex<Vec<String>>>,
        result: serde_json::Value,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            journal: Arc::clone(journal),
            result,
            fail_execute: false,
            fail_compensate: true,
        })
    }
}

impl SagaStep for RecordingStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(
        &self,
        _context: SagaContext,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, SagaError>> + Send + '_>> {
        Box::pin(async move {
            self.journal.lock().unwrap().push(format!("execute:{}", self.name));
            if self.fail_execute {
                Err(SagaError::step_failed(self.name.clone(), "step exploded"))
            } else {
                Ok(self.result.clone())
            }
        })
    }

    fn compensate(
        &self,
        _context: SagaContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), SagaError>> + Send + '_>> {
        Box::pin(async move {
            self.journal.lock().unwrap().push(format!("compensate:{}", self.name));
            if self.fail_compensate {
                Err(SagaError::step_failed(self.name.clone(), "compensation exploded"))
            } else {
                Ok(())
            }
        })
    }
}

fn orchestrator(registry: SagaRegistry) -> (SagaOrchestrator, Arc<InMemorySagaStore>) {
    let store = Arc::new(InMemorySagaStore::new());
    let orchestrator = SagaOrchestrator::new(
        Arc::new(registry),
        Arc::clone(&store) as Arc<dyn SagaStore>,
        Arc::new(test_clock()),
    );
    (orchestrator, store)
}

#[tokio::test]
async fn all_steps_succeed_completes_execution() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let mut registry = SagaRegistry::new();
    registry.register(SagaDefinition::new(
        "two_step",
        vec![
            RecordingStep::ok("first", &journal, serde_json::json!({"id": "a"})),
            RecordingStep::ok("second", &journal, serde_json::json!({"id": "b"})),
        ],
    ));
    let (orchestrator, _store) = orchestrator(registry);

    let execution = orchestrator.execute("two_step", SagaContext::new()).await.unwrap();

    assert_eq!(execution.status, SagaStatus::Completed);
    assert_eq!(execution.completed_steps, vec!["first", "second"]);
    assert!(execution.completed_at.is_some());
    assert!(execution.failed_step.is_none());
    assert_eq!(
        *journal.lock().unwrap(),
        vec!["execute:first", "execute:second"]
    );
    // Each step's result landed in the context under the step name.
    assert_eq!(
        execution.context.raw("first"),
        Some(&serde_json::json!({"id": "a"}))
    );
}

#[tokio::test]
async fn later_steps_read_earlier_results() {
    /// Step that derives its result from the previous step's.
    struct DependentStep;

    impl SagaStep for DependentStep {
        fn name(&self) -> &str {
            "dependent"
        }

        fn execute(
            &self,
            context: SagaContext,
        ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, SagaError>> + Send + '_>>
        {
            Box::pin(async move {
                let upstream: Option<serde_json::Value> = context.get("seed");
                let seed = upstream.ok_or_else(|| {
                    SagaError::step_failed("dependent", "seed result missing from context")
                })?;
                let id = seed.get("id").and_then(|v| v.as_str()).unwrap_or("?");
                Ok(serde_json::json!({"derived_from": id}))
            })
        }

        fn compensate(
            &self,
            _context: SagaContext,
        ) -> Pin<Box<dyn Future<Output = Result<(), SagaError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }
    }

    let journal = Arc::new(Mutex::new(Vec::new()));
    let mut registry = SagaRegistry::new();
    registry.register(SagaDefinition::new(
        "chained",
        vec![
            RecordingStep::ok("seed", &journal, serde_json::json!({"id": "p-42"})),
            Arc::new(DependentStep),
        ],
    ));
    let (orchestrator, _store) = orchestrator(registry);

    let execution = orchestrator.execute("chained", SagaContext::new()).await.unwrap();

    assert_eq!(
        execution.context.raw("dependent"),
        Some(&serde_json::json!({"derived_from": "p-42"}))
    );
}

#[tokio::test]
async fn failure_compensates_in_reverse_order_and_rethrows_original() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let mut registry = SagaRegistry::new();
    registry.register(SagaDefinition::new(
        "three_step",
        vec![
            RecordingStep::ok("a", &journal, serde_json::json!(1)),
            RecordingStep::ok("b", &journal, serde_json::json!(2)),
            RecordingStep::failing("c", &journal),
        ],
    ));
    let (orchestrator, store) = orchestrator(registry);

    let error = orchestrator.execute("three_step", SagaContext::new()).await.unwrap_err();

    // The caller sees the ORIGINAL step error.
    assert!(matches!(
        &error,
        SagaError::StepFailed { step, message } if step == "c" && message == "step exploded"
    ));

    assert_eq!(
        *journal.lock().unwrap(),
        vec![
            "execute:a",
            "execute:b",
            "execute:c",
            "compensate:b",
            "compensate:a",
        ]
    );

    let history = store.history(Some("three_step"), 10).await.unwrap();
    let execution = &history[0];
    assert_eq!(execution.status, SagaStatus::Compensated);
    assert_eq!(execution.failed_step.as_deref(), Some("c"));
    assert!(execution.error.as_deref().unwrap().contains("step exploded"));
    assert!(execution.completed_at.is_some());
}

#[tokio::test]
async fn compensation_failure_does_not_stop_remaining_compensations() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let mut registry = SagaRegistry::new();
    registry.register(SagaDefinition::new(
        "totality",
        vec![
            RecordingStep::ok("a", &journal, serde_json::json!(1)),
            RecordingStep::with_failing_compensation("b", &journal, serde_json::json!(2)),
            RecordingStep::failing("c", &journal),
        ],
    ));
    let (orchestrator, store) = orchestrator(registry);

    let error = orchestrator.execute("totality", SagaContext::new()).await.unwrap_err();

    // b's compensation failed, a's still ran.
    assert_eq!(
        *journal.lock().unwrap(),
        vec![
            "execute:a",
            "execute:b",
            "execute:c",
            "compensate:b",
            "compensate:a",
        ]
    );

    // Terminal state is Compensated regardless, and the original error is
    // what propagated (not b's compensation error).
    let execution = &store.history(None, 1).await.unwrap()[0];
    assert_eq!(execution.status, SagaStatus::Compensated);
    assert!(matches!(&error, SagaError::StepFailed { step, .. } if step == "c"));
    assert!(execution.error.as_deref().unwrap().contains("step exploded"));
}

#[tokio::test]
async fn create_project_with_setup_scenario() {
    // The canonical multi-step business flow: create a project, seed its
    // initial tasks, send the welcome email. Task seeding fails, so the
    // project creation is rolled back and the email is never attempted.
    let journal = Arc::new(Mutex::new(Vec::new()));
    let mut registry = SagaRegistry::new();
    registry.register(SagaDefinition::new(
        "create_project_with_setup",
        vec![
            RecordingStep::ok("create_project", &journal, serde_json::json!({"project_id": "p-1"})),
            RecordingStep::failing("create_initial_tasks", &journal),
            RecordingStep::ok("send_welcome_email", &journal, serde_json::json!({"sent": true})),
        ],
    ));
    let (orchestrator, store) = orchestrator(registry);

    let mut initial = SagaContext::new();
    initial.insert("tenant_id", &serde_json::json!("tenant-1"));
    let result = orchestrator.execute("create_project_with_setup", initial).await;
    assert!(result.is_err());

    let execution = &store.history(None, 1).await.unwrap()[0];
    assert_eq!(execution.status, SagaStatus::Compensated);
    assert_eq!(execution.failed_step.as_deref(), Some("create_initial_tasks"));
    assert_eq!(execution.completed_steps, vec!["create_project"]);

    let journal = journal.lock().unwrap();
    assert!(journal.contains(&"compensate:create_project".to_string()));
    assert!(!journal.iter().any(|entry| entry == "execute:send_welcome_email"));
}

#[tokio::test]
async fn unknown_saga_is_an_error() {
    let (orchestrator, _store) = orchestrator(SagaRegistry::new());
    let error = orchestrator.execute("missing", SagaContext::new()).await.unwrap_err();
    assert!(matches!(error, SagaError::UnknownSaga(name) if name == "missing"));
}

#[tokio::test]
async fn history_and_stats_reflect_executions() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let mut registry = SagaRegistry::new();
    registry.register(SagaDefinition::new(
        "ok_saga",
        vec![RecordingStep::ok("only", &journal, serde_json::json!(null))],
    ));
    registry.register(SagaDefinition::new(
        "bad_saga",
        vec![RecordingStep::failing("boom", &journal)],
    ));
    let (orchestrator, _store) = orchestrator(registry);

    orchestrator.execute("ok_saga", SagaContext::new()).await.unwrap();
    let _ = orchestrator.execute("bad_saga", SagaContext::new()).await;

    let history = orchestrator.history(None, 10).await.unwrap();
    assert_eq!(history.len(), 2);

    let stats = orchestrator.stats().await.unwrap();
    let completed = stats
        .iter()
        .find(|row| row.saga_name == "ok_saga")
        .unwrap();
    assert_eq!(completed.status, SagaStatus::Completed);
    assert_eq!(completed.count, 1);

    let compensated = stats
        .iter()
        .find(|row| row.saga_name == "bad_saga")
        .unwrap();
    assert_eq!(compensated.status, SagaStatus::Compensated);
}
