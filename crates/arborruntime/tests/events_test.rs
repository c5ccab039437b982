// crates/arborruntime/tests/events_test.rs

mod common;

use arborcore::{LogLevel, Value, WorkflowEvent, WorkflowStatus};
use arborruntime::Workflow;
use common::{init_tracing, Credentials, PanickingObserver, RecordingObserver};
use std::sync::Arc;

#[test]
fn test_each_status_change_notifies_tree_changed_with_root() {
    init_tracing();

    let root = Workflow::new("root");
    let child = Workflow::child_of(&root, "child").unwrap();
    let observer = RecordingObserver::new();
    root.add_observer(observer.clone()).unwrap();

    let statuses = [
        WorkflowStatus::Running,
        WorkflowStatus::Failed,
        WorkflowStatus::Running,
        WorkflowStatus::Completed,
        WorkflowStatus::Cancelled,
    ];
    for status in statuses {
        child.set_status(status).unwrap();
    }

    assert_eq!(observer.tree_changes(), vec![root.id(); statuses.len()]);
    assert_eq!(observer.count("tree_updated"), statuses.len());
    assert_eq!(child.status(), WorkflowStatus::Cancelled);
    assert_eq!(child.node().status(), WorkflowStatus::Cancelled);
}

#[test]
fn test_observers_are_called_in_registration_order() {
    let root = Workflow::new("root");
    let leaf = Workflow::child_of(&Workflow::child_of(&root, "middle").unwrap(), "leaf").unwrap();

    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    for label in ["first", "second"] {
        root.add_observer(Arc::new(OrderObserver {
            label,
            order: order.clone(),
        }))
        .unwrap();
    }

    leaf.emit(WorkflowEvent::StepStart {
        node_id: leaf.id(),
        step: "fetch".to_string(),
    })
    .unwrap();

    assert_eq!(*order.lock(), vec!["first", "second"]);
    assert_eq!(leaf.node().events().len(), 1);
    assert!(root.node().events().iter().all(|e| e.kind() == "child_attached"));
}

#[test]
fn test_panicking_observer_does_not_reach_others() {
    let root = Workflow::new("root");
    let recorder = RecordingObserver::new();
    root.add_observer(Arc::new(PanickingObserver)).unwrap();
    root.add_observer(recorder.clone()).unwrap();

    let child = Workflow::child_of(&root, "child").unwrap();
    child.info("still here");
    child.set_status(WorkflowStatus::Running).unwrap();

    assert_eq!(recorder.event_kinds(), vec!["child_attached", "tree_updated"]);
    assert_eq!(recorder.tree_changes().len(), 2);
    assert_eq!(recorder.logs().len(), 1);
}

#[test]
fn test_logs_reach_node_and_root_observers() {
    let root = Workflow::new("root");
    let observer = RecordingObserver::new();
    root.add_observer(observer.clone()).unwrap();
    let child = Workflow::child_of(&root, "child").unwrap();

    child.info("fetching");
    child.log_with_data(LogLevel::Warn, "slow response", 1200u64);

    let logs = child.node().logs();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].message, "fetching");
    assert_eq!(logs[1].level, LogLevel::Warn);
    assert_eq!(logs[1].data, Some(Value::from(1200u64)));
    assert!(logs.iter().all(|l| l.workflow_id == child.id()));

    let seen: Vec<_> = observer.logs().into_iter().map(|l| l.message).collect();
    assert_eq!(seen, vec!["fetching", "slow response"]);
    assert!(root.node().logs().is_empty());
}

#[test]
fn test_snapshot_emits_state_then_tree_update() {
    let root = Workflow::new("root");
    let observer = RecordingObserver::new();
    root.add_observer(observer.clone()).unwrap();
    let child = Workflow::new("child").with_state(Credentials::sample());
    root.attach_child(&child).unwrap();
    observer.clear();

    let state = child.snapshot_state().unwrap();

    assert_eq!(observer.event_kinds(), vec!["state_snapshot", "tree_updated"]);
    assert_eq!(observer.state_updates(), vec![child.id()]);
    assert_eq!(observer.tree_changes(), vec![root.id()]);
    assert_eq!(child.node().state_snapshot(), Some(state.clone()));
    match &observer.events()[0] {
        WorkflowEvent::StateSnapshot { node_id, state: sent } => {
            assert_eq!(*node_id, child.id());
            assert_eq!(sent, &state);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_event_bus_streams_observer_callbacks() {
    let root = Workflow::new("root");
    let bus = Arc::new(arborcore::EventBus::new(64));
    let mut rx = bus.subscribe();
    root.add_observer(bus.clone()).unwrap();

    root.info("hello");
    root.set_status(WorkflowStatus::Running).unwrap();

    match rx.recv().await.unwrap() {
        arborcore::BusMessage::Log(entry) => assert_eq!(entry.message, "hello"),
        other => panic!("unexpected message: {:?}", other),
    }
    match rx.recv().await.unwrap() {
        arborcore::BusMessage::Event(event) => assert_eq!(event.kind(), "tree_updated"),
        other => panic!("unexpected message: {:?}", other),
    }
    match rx.recv().await.unwrap() {
        arborcore::BusMessage::TreeChanged { root_id, root_status } => {
            assert_eq!(root_id, root.id());
            assert_eq!(root_status, WorkflowStatus::Running);
        }
        other => panic!("unexpected message: {:?}", other),
    }
}

struct OrderObserver {
    label: &'static str,
    order: Arc<parking_lot::Mutex<Vec<&'static str>>>,
}

impl arborcore::WorkflowObserver for OrderObserver {
    fn on_log(&self, _entry: &arborcore::LogEntry) {}

    fn on_event(&self, _event: &WorkflowEvent) {
        self.order.lock().push(self.label);
    }

    fn on_state_updated(&self, _node: &arborcore::NodeHandle) {}

    fn on_tree_changed(&self, _root: &arborcore::NodeHandle) {}
}
