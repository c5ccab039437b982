// crates/arborruntime/tests/common/mod.rs

#![allow(dead_code)]

use arborcore::{
    Agent, AgentRequest, FlowError, LogEntry, NodeHandle, ObservedField, ObservedState, Result,
    WorkflowEvent, WorkflowId, WorkflowObserver,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

/// Observer that keeps everything it is told
#[derive(Default)]
pub struct RecordingObserver {
    logs: Mutex<Vec<LogEntry>>,
    events: Mutex<Vec<WorkflowEvent>>,
    state_updates: Mutex<Vec<WorkflowId>>,
    tree_changes: Mutex<Vec<WorkflowId>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs.lock().clone()
    }

    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events.lock().clone()
    }

    pub fn event_kinds(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(WorkflowEvent::kind).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }

    pub fn state_updates(&self) -> Vec<WorkflowId> {
        self.state_updates.lock().clone()
    }

    pub fn tree_changes(&self) -> Vec<WorkflowId> {
        self.tree_changes.lock().clone()
    }

    pub fn clear(&self) {
        self.logs.lock().clear();
        self.events.lock().clear();
        self.state_updates.lock().clear();
        self.tree_changes.lock().clear();
    }
}

impl WorkflowObserver for RecordingObserver {
    fn on_log(&self, entry: &LogEntry) {
        self.logs.lock().push(entry.clone());
    }

    fn on_event(&self, event: &WorkflowEvent) {
        self.events.lock().push(event.clone());
    }

    fn on_state_updated(&self, node: &NodeHandle) {
        self.state_updates.lock().push(node.id());
    }

    fn on_tree_changed(&self, root: &NodeHandle) {
        self.tree_changes.lock().push(root.id());
    }
}

/// Observer whose every callback panics
pub struct PanickingObserver;

impl WorkflowObserver for PanickingObserver {
    fn on_log(&self, _entry: &LogEntry) {
        panic!("on_log exploded");
    }

    fn on_event(&self, _event: &WorkflowEvent) {
        panic!("on_event exploded");
    }

    fn on_state_updated(&self, _node: &NodeHandle) {
        panic!("on_state_updated exploded");
    }

    fn on_tree_changed(&self, _root: &NodeHandle) {
        panic!("on_tree_changed exploded");
    }
}

/// Agent answering from a script, one response per call
pub struct ScriptedAgent {
    name: String,
    responses: Mutex<VecDeque<Result<serde_json::Value>>>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new(name: &str, responses: Vec<Result<serde_json::Value>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn respond(&self, request: AgentRequest) -> Result<serde_json::Value> {
        self.requests.lock().push(request);
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(FlowError::Agent("script exhausted".to_string())))
    }
}

/// Observed state with one field per policy
pub struct Credentials {
    pub user: String,
    pub token: String,
    pub scratch: String,
}

impl Credentials {
    pub fn sample() -> Arc<Self> {
        Arc::new(Self {
            user: "ada".to_string(),
            token: "s3cret".to_string(),
            scratch: "/tmp/work".to_string(),
        })
    }
}

impl ObservedState for Credentials {
    fn observed_fields(&self) -> Vec<ObservedField> {
        vec![
            ObservedField::new("user", self.user.as_str()),
            ObservedField::new("token", self.token.as_str()).redacted(),
            ObservedField::new("scratch", self.scratch.as_str()).hidden(),
        ]
    }
}
