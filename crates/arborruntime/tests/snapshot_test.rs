// crates/arborruntime/tests/snapshot_test.rs

mod common;

use arborcore::{FlowError, LogLevel, Value, WorkflowEvent, WorkflowStatus, REDACTED};
use arborruntime::{ExecutionContext, StepOptions, Workflow};
use common::{init_tracing, Credentials, RecordingObserver};

#[test]
fn test_redacted_and_hidden_fields() {
    let workflow = Workflow::new("login").with_state(Credentials::sample());

    let state = workflow.capture_state();

    assert_eq!(state.get("user"), Some(&Value::from("ada")));
    assert_eq!(state.get("token"), Some(&Value::from(REDACTED)));
    assert!(!state.contains_key("scratch"));
    assert_eq!(state.len(), 2);
}

#[test]
fn test_workflow_without_state_snapshots_empty() {
    let workflow = Workflow::new("stateless");
    assert!(workflow.capture_state().is_empty());
    assert!(workflow.snapshot_state().unwrap().is_empty());
}

#[tokio::test]
async fn test_failing_step_error_keeps_its_own_log_copy() {
    init_tracing();

    let workflow = Workflow::new("login")
        .with_state(Credentials::sample())
        .with_executor(|ctx: ExecutionContext| async move {
            ctx.info("connecting");
            ctx.step("authenticate", || async {
                Err::<(), _>(FlowError::execution("handshake rejected"))
            })
            .await?;
            Ok(Value::Null)
        });
    let observer = RecordingObserver::new();
    workflow.add_observer(observer.clone()).unwrap();

    let error = workflow.run().await.unwrap_err();
    assert_eq!(workflow.status(), WorkflowStatus::Failed);

    let reported: Vec<_> = observer
        .events()
        .into_iter()
        .filter_map(|event| match event {
            WorkflowEvent::Error { error, .. } => Some(error),
            _ => None,
        })
        .collect();
    assert_eq!(reported.len(), 1, "the step's failure is reported once");
    let reported = &reported[0];

    assert!(reported.message.contains("handshake rejected"));
    assert_eq!(reported.workflow_id, workflow.id());
    assert_eq!(reported.state.get("token"), Some(&Value::from(REDACTED)));
    assert!(!reported.state.contains_key("scratch"));
    assert!(reported.logs.iter().any(|l| l.message == "connecting"));

    let captured_len = reported.logs.len();
    workflow.info("after the failure");
    workflow.log(LogLevel::Error, "and more");

    assert!(workflow.node().logs().len() >= captured_len + 2);
    assert_eq!(reported.logs.len(), captured_len);
    assert_eq!(error.as_workflow_error().unwrap().logs.len(), captured_len);
    assert!(matches!(
        error.as_workflow_error().unwrap().original(),
        Some(FlowError::Execution(_))
    ));
}

#[tokio::test]
async fn test_completed_run_stores_snapshot() {
    let workflow = Workflow::new("login")
        .with_state(Credentials::sample())
        .with_executor(|ctx: ExecutionContext| async move {
            ctx.step_with(StepOptions::new("warm-up").with_snapshot(), || async {
                Ok(Value::from(true))
            })
            .await
        });
    let observer = RecordingObserver::new();
    workflow.add_observer(observer.clone()).unwrap();

    assert_eq!(workflow.run().await.unwrap(), Value::from(true));

    let snapshot = workflow.node().state_snapshot().unwrap();
    assert_eq!(snapshot.get("user"), Some(&Value::from("ada")));
    assert_eq!(observer.state_updates(), vec![workflow.id()]);
    assert_eq!(
        observer.event_kinds(),
        vec![
            "tree_updated",
            "step_start",
            "step_end",
            "state_snapshot",
            "tree_updated",
            "tree_updated"
        ]
    );
}

#[tokio::test]
async fn test_missing_executor_fails_the_run() {
    let workflow = Workflow::new("empty");

    let error = workflow.run().await.unwrap_err();

    assert!(error.to_string().contains("no executor"));
    assert_eq!(workflow.status(), WorkflowStatus::Failed);
    assert_eq!(workflow.node().status(), WorkflowStatus::Failed);
}
