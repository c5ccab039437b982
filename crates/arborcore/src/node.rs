use crate::{events::WorkflowEvent, snapshot::StateMap, Value};
use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

pub type WorkflowId = Uuid;

/// Lifecycle status shared by a workflow and its node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Idle => "idle",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
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

/// One entry of a node's log buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub workflow_id: WorkflowId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl LogEntry {
    pub fn new(workflow_id: WorkflowId, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            workflow_id,
            data: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = Some(data.into());
        self
    }
}

/// Serializable data counterpart of a workflow.
///
/// `parent` is the parent's id rather than a pointer, so the data tree owns
/// its nodes strictly top-down.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: WorkflowId,
    pub name: String,
    pub parent: Option<WorkflowId>,
    #[serde(default)]
    pub children: Vec<NodeHandle>,
    #[serde(default)]
    pub status: WorkflowStatus,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub events: Vec<WorkflowEvent>,
    #[serde(default)]
    pub state_snapshot: Option<StateMap>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl WorkflowNode {
    pub fn new(id: WorkflowId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            parent: None,
            children: Vec::new(),
            status: WorkflowStatus::Idle,
            logs: Vec::new(),
            events: Vec::new(),
            state_snapshot: None,
            metadata: BTreeMap::new(),
        }
    }
}

/// Shared handle to a [`WorkflowNode`].
///
/// Readers go through [`NodeHandle::read`]; mutation is limited to the
/// operations the workflow lifecycle and tree manager perform.
#[derive(Clone)]
pub struct NodeHandle {
    id: WorkflowId,
    inner: Arc<RwLock<WorkflowNode>>,
}

impl NodeHandle {
    pub fn new(id: WorkflowId, name: impl Into<String>) -> Self {
        Self::from_node(WorkflowNode::new(id, name))
    }

    pub fn from_node(node: WorkflowNode) -> Self {
        Self {
            id: node.id,
            inner: Arc::new(RwLock::new(node)),
        }
    }

    pub fn id(&self) -> WorkflowId {
        self.id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, WorkflowNode> {
        self.inner.read()
    }

    pub fn ptr_eq(&self, other: &NodeHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn name(&self) -> String {
        self.inner.read().name.clone()
    }

    pub fn status(&self) -> WorkflowStatus {
        self.inner.read().status
    }

    pub fn parent_id(&self) -> Option<WorkflowId> {
        self.inner.read().parent
    }

    pub fn children(&self) -> Vec<NodeHandle> {
        self.inner.read().children.clone()
    }

    pub fn contains_child(&self, child: &NodeHandle) -> bool {
        self.inner.read().children.iter().any(|c| c.ptr_eq(child))
    }

    /// Copy of the log buffer.
    pub fn logs(&self) -> Vec<LogEntry> {
        self.inner.read().logs.clone()
    }

    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.inner.read().events.clone()
    }

    pub fn state_snapshot(&self) -> Option<StateMap> {
        self.inner.read().state_snapshot.clone()
    }

    pub fn metadata(&self, key: &str) -> Option<Value> {
        self.inner.read().metadata.get(key).cloned()
    }

    pub fn push_child(&self, child: &NodeHandle) {
        self.inner.write().children.push(child.clone());
    }

    /// Remove `child` by identity; returns whether it was present.
    pub fn remove_child(&self, child: &NodeHandle) -> bool {
        let mut node = self.inner.write();
        let before = node.children.len();
        node.children.retain(|c| !c.ptr_eq(child));
        node.children.len() != before
    }

    pub fn set_parent(&self, parent: Option<WorkflowId>) {
        self.inner.write().parent = parent;
    }

    pub fn set_status(&self, status: WorkflowStatus) {
        self.inner.write().status = status;
    }

    pub fn push_log(&self, entry: LogEntry) {
        self.inner.write().logs.push(entry);
    }

    pub fn push_event(&self, event: WorkflowEvent) {
        self.inner.write().events.push(event);
    }

    pub fn set_state_snapshot(&self, state: StateMap) {
        self.inner.write().state_snapshot = Some(state);
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.inner.write().metadata.insert(key.into(), value.into());
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = self.inner.read();
        f.debug_struct("NodeHandle")
            .field("id", &node.id)
            .field("name", &node.name)
            .field("status", &node.status)
            .field("children", &node.children.len())
            .finish()
    }
}

impl Serialize for NodeHandle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.inner.read().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for NodeHandle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        WorkflowNode::deserialize(deserializer).map(NodeHandle::from_node)
    }
}
