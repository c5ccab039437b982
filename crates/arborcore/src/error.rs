use crate::node::{LogEntry, WorkflowId};
use crate::snapshot::StateMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum FlowError {
    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Workflow(Box<WorkflowError>),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Step '{step}' timed out after {millis}ms")]
    Timeout { step: String, millis: u64 },

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl FlowError {
    pub fn execution(message: impl Into<String>) -> Self {
        FlowError::Execution(message.into())
    }

    /// The captured workflow error, if this error already crossed a failure boundary.
    pub fn as_workflow_error(&self) -> Option<&WorkflowError> {
        match self {
            FlowError::Workflow(e) => Some(e),
            _ => None,
        }
    }

    /// Structural violations are programmer errors and are never retried.
    pub fn is_structural(&self) -> bool {
        matches!(self, FlowError::Tree(_))
    }
}

impl From<WorkflowError> for FlowError {
    fn from(e: WorkflowError) -> Self {
        FlowError::Workflow(Box::new(e))
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(e: serde_json::Error) -> Self {
        FlowError::Serialization(e.to_string())
    }
}

/// Violations of the workflow tree's structure.
///
/// Workflows are named as `name (id)` in messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("Workflow {child} is already attached to {parent}")]
    AlreadyAttached { parent: String, child: String },

    #[error(
        "Workflow {child} already has parent {current_parent}; \
         detach it from {current_parent} with detach_child() before attaching it to {new_parent}"
    )]
    ParentConflict {
        child: String,
        current_parent: String,
        new_parent: String,
    },

    #[error("Attaching {child} to {parent} would create a circular reference: {parent} is a descendant of {child}")]
    CircularReference { parent: String, child: String },

    #[error("Workflow {child} is not attached to {parent}")]
    NotAttached { parent: String, child: String },

    #[error("Observers can only be added to a root workflow; {workflow} has parent {parent}")]
    NotRoot { workflow: String, parent: String },

    #[error("Cycle detected in workflow tree at {workflow}")]
    CycleDetected { workflow: String },
}

/// An execution failure captured at the boundary where it happened.
///
/// `state` and `logs` are copies taken at capture time; later activity on the
/// failing node does not change them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowError {
    pub message: String,
    #[serde(skip_deserializing, serialize_with = "serialize_cause")]
    pub original: Option<Box<FlowError>>,
    pub workflow_id: WorkflowId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default)]
    pub state: StateMap,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    pub timestamp: DateTime<Utc>,
}

impl WorkflowError {
    pub fn new(workflow_id: WorkflowId, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            original: None,
            workflow_id,
            stack: None,
            state: StateMap::new(),
            logs: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Wrap `cause` with the failing workflow's state and log buffer.
    pub fn capture(
        workflow_id: WorkflowId,
        cause: FlowError,
        state: StateMap,
        logs: Vec<LogEntry>,
    ) -> Self {
        Self {
            message: cause.to_string(),
            original: Some(Box::new(cause)),
            workflow_id,
            stack: capture_stack(),
            state,
            logs,
            timestamp: Utc::now(),
        }
    }

    pub fn with_state(mut self, state: StateMap) -> Self {
        self.state = state;
        self
    }

    pub fn with_logs(mut self, logs: Vec<LogEntry>) -> Self {
        self.logs = logs;
        self
    }

    pub fn original(&self) -> Option<&FlowError> {
        self.original.as_deref()
    }
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for WorkflowError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.original
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

fn capture_stack() -> Option<String> {
    let backtrace = Backtrace::capture();
    match backtrace.status() {
        BacktraceStatus::Captured => Some(backtrace.to_string()),
        _ => None,
    }
}

fn serialize_cause<S>(cause: &Option<Box<FlowError>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match cause {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}
